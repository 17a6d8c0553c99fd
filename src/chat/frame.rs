//! Wire frames of the order chat socket.
//!
//! Outgoing and incoming frames are JSON objects tagged by `"type"`:
//!
//! ```json
//! {"type":"chat_message","order_id":7,"to_user_id":42,"content":"at the gate"}
//! {"type":"chat_message","order_id":7,"from_user_id":42,"to_user_id":3,"content":"ok","created_at":"2025-01-01T10:00:00Z"}
//! ```
//!
//! Anything else the server pushes (pings, presence, half-formed messages)
//! is classified as [`FrameOutcome::Drop`] rather than patched up with
//! default values.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::chat::{ChatMessage, ChatSender};
use crate::models::order::{OrderId, UserId};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        order_id: OrderId,
        to_user_id: UserId,
        content: String,
    },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    ChatMessage(IncomingChat),
}

#[derive(Debug, Clone, Deserialize)]
struct IncomingChat {
    order_id: OrderId,
    from_user_id: UserId,
    to_user_id: UserId,
    content: String,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Chat(ChatMessage),
    Drop(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, unknown `type`, or a required field missing.
    Malformed(String),
    EmptyContent,
    ForeignOrder(OrderId),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            DropReason::EmptyContent => f.write_str("empty content"),
            DropReason::ForeignOrder(order_id) => write!(f, "frame for order {order_id}"),
        }
    }
}

/// Classifies one text frame received on the socket of `order_id`.
pub fn parse_frame(order_id: OrderId, text: &str) -> FrameOutcome {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(err) => return FrameOutcome::Drop(DropReason::Malformed(err.to_string())),
    };

    let ServerFrame::ChatMessage(chat) = frame;

    if chat.order_id != order_id {
        return FrameOutcome::Drop(DropReason::ForeignOrder(chat.order_id));
    }
    if chat.content.trim().is_empty() {
        return FrameOutcome::Drop(DropReason::EmptyContent);
    }

    FrameOutcome::Chat(ChatMessage {
        order_id: chat.order_id,
        from: ChatSender::User(chat.from_user_id),
        to_user: chat.to_user_id,
        content: chat.content,
        created_at: chat
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
    })
}

/// Accepts RFC 3339 and the backend's `YYYY-MM-DD HH:MM:SS` (UTC) format.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
