use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::sync::{ClaimOutcome, Snapshot};
use crate::error::AppError;
use crate::models::order::{OrderDetail, OrderId, OrderListView, OrderStatus, UserId};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/available", get(available_orders))
        .route("/orders/mine", get(my_orders))
        .route("/orders/refresh", post(refresh_orders))
        .route("/orders/:id", get(order_detail))
        .route("/orders/:id/claim", post(claim_order))
        .route("/orders/:id/delivered", post(mark_delivered))
}

#[derive(Deserialize, Default)]
pub struct ClaimRequest {
    #[serde(default)]
    pub customer_id: Option<UserId>,
}

#[derive(Serialize)]
pub struct ListsResponse {
    pub available: Snapshot<OrderListView>,
    pub mine: Snapshot<OrderListView>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub order_id: OrderId,
    pub status: Option<OrderStatus>,
}

async fn available_orders(State(state): State<Arc<AppState>>) -> Json<Snapshot<OrderListView>> {
    Json(state.sync.available())
}

async fn my_orders(State(state): State<Arc<AppState>>) -> Json<Snapshot<OrderListView>> {
    Json(state.sync.mine())
}

async fn refresh_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListsResponse>, AppError> {
    state.sync.refresh_all().await?;

    Ok(Json(ListsResponse {
        available: state.sync.available(),
        mine: state.sync.mine(),
    }))
}

async fn order_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
) -> Result<Json<OrderDetail>, AppError> {
    let detail = state.sync.load_detail(id).await?;
    Ok(Json(detail))
}

async fn claim_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    payload: Option<Json<ClaimRequest>>,
) -> Result<Json<ClaimOutcome>, AppError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    // the claim keeps running if the caller disconnects
    let outcome = state
        .sync
        .spawn_claim(id, request.customer_id)
        .await
        .map_err(|err| AppError::Internal(format!("claim task failed: {err}")))??;

    Ok(Json(outcome))
}

async fn mark_delivered(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
) -> Result<(StatusCode, Json<StatusResponse>), AppError> {
    state
        .sync
        .spawn_mark_delivered(id)
        .await
        .map_err(|err| AppError::Internal(format!("status update task failed: {err}")))??;

    Ok((
        StatusCode::OK,
        Json(StatusResponse {
            order_id: id,
            status: state.sync.status_of(id),
        }),
    ))
}
