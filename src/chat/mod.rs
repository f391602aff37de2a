//! Chat transport capability.
//!
//! The dispatcher consumes `GatewayEvent`s and replies through a `ChatSink`;
//! it never touches the websocket itself.

pub mod discord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message-received event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub content: String,
    pub channel_id: String,
    pub author_id: String,
    /// When the chat service stamped the message, if it did.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Session established; `user_id` is the bot's own identity.
    Ready { user_id: String },
    Message(InboundMessage),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("failed to deliver message to channel {channel_id}: {reason}")]
pub struct DeliveryError {
    pub channel_id: String,
    pub reason: String,
}

/// Outbound half of the transport: send text to a channel.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError>;
}
