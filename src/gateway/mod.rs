pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::order::{OrderDetail, OrderId, OrderListView, OrderStatus, PaymentStatus};

pub use http::HttpGateway;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self { page: 1, limit }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(20)
    }
}

/// Request/response boundary to the backend order API. Implementations
/// hold no authoritative state; every call is one network round trip.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Processing orders this courier may claim. An empty backend answer is
    /// an empty view, not an error.
    async fn list_available(&self, page: PageRequest) -> Result<OrderListView, AppError>;

    /// Orders this courier has claimed.
    async fn list_mine(&self, page: PageRequest) -> Result<OrderListView, AppError>;

    async fn fetch_detail(&self, order_id: OrderId) -> Result<OrderDetail, AppError>;

    async fn claim(&self, order_id: OrderId) -> Result<(), AppError>;

    async fn update_status(
        &self,
        order_id: OrderId,
        payment_status: PaymentStatus,
        order_status: OrderStatus,
    ) -> Result<(), AppError>;
}
