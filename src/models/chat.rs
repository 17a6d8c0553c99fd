use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::order::{OrderId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "user_id")]
pub enum ChatSender {
    /// Written on this device.
    Me,
    User(UserId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub order_id: OrderId,
    pub from: ChatSender,
    pub to_user: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn outgoing(order_id: OrderId, to_user: UserId, content: impl Into<String>) -> Self {
        Self {
            order_id,
            from: ChatSender::Me,
            to_user,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_mine(&self) -> bool {
        self.from == ChatSender::Me
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}
