use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::chat::{ChatMessage, ChatState};
use crate::models::order::OrderId;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/:order_id", get(chat_state))
        .route(
            "/chat/:order_id/messages",
            get(transcript).post(send_message),
        )
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Serialize)]
pub struct ChatStateResponse {
    pub order_id: OrderId,
    pub state: ChatState,
}

async fn chat_state(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<ChatStateResponse>, AppError> {
    let session = state
        .coordinator
        .session(order_id)
        .ok_or_else(|| AppError::NotFound(format!("no chat for order {order_id}")))?;

    Ok(Json(ChatStateResponse {
        order_id,
        state: session.state(),
    }))
}

async fn transcript(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    state
        .coordinator
        .transcript(order_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no chat for order {order_id}")))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<OrderId>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<StatusCode, AppError> {
    if payload.content.trim().is_empty() {
        return Err(AppError::BadRequest("content cannot be empty".to_string()));
    }

    if state.coordinator.send(order_id, &payload.content) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::ChannelClosed)
    }
}
