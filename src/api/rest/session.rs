use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Serialize;

use crate::error::AppError;
use crate::models::account::{LoginRequest, UserProfile};
use crate::models::order::UserId;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .route("/profile", get(profile))
        .route("/customers/:id", get(customer))
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub signed_in: bool,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(AppError::BadRequest(
            "email and password are required".to_string(),
        ));
    }

    state.gateway.login(&payload.email, &payload.password).await?;
    Ok(Json(SessionResponse { signed_in: true }))
}

async fn logout(State(state): State<Arc<AppState>>) -> StatusCode {
    state.gateway.logout();
    StatusCode::NO_CONTENT
}

async fn profile(State(state): State<Arc<AppState>>) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.gateway.fetch_profile().await?))
}

async fn customer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<UserId>,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.gateway.fetch_user(id).await?))
}
