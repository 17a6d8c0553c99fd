use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Server(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("order already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("chat channel closed")]
    ChannelClosed,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::Server(format!("unreadable response body: {err}"))
        } else {
            AppError::Network(err.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyClaimed(_) | AppError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Network(_) | AppError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Server(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
