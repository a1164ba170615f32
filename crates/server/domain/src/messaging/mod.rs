//! Ports consumed by webhook processing
//!
//! The message, contact and channel aggregates live outside this crate; the
//! raw event processor reaches them only through these narrow traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors returned by the messaging ports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Delivery status of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDeliveryStatus {
    Sent,
    Delivered,
    Read,
    Played,
}

impl MessageDeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDeliveryStatus::Sent => "sent",
            MessageDeliveryStatus::Delivered => "delivered",
            MessageDeliveryStatus::Read => "read",
            MessageDeliveryStatus::Played => "played",
        }
    }
}

/// Connectivity of a channel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelConnectionState {
    Connecting,
    AwaitingQrScan,
    Connected,
    Disconnected,
    Failed,
}

impl ChannelConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelConnectionState::Connecting => "connecting",
            ChannelConnectionState::AwaitingQrScan => "awaiting_qr_scan",
            ChannelConnectionState::Connected => "connected",
            ChannelConnectionState::Disconnected => "disconnected",
            ChannelConnectionState::Failed => "failed",
        }
    }
}

/// A message received through a channel webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform id of the message, unique per channel
    pub channel_message_id: String,
    /// Channel session the webhook belongs to
    pub session: String,
    /// Sent by the channel identity itself
    pub from_me: bool,
    /// Chat counterpart (recipient when `from_me`, sender otherwise)
    pub remote_id: String,
    pub text: Option<String>,
    pub has_media: bool,
    pub sent_at: DateTime<Utc>,
    /// Untouched platform payload
    pub raw_payload: serde_json::Value,
}

/// Result of recording an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub message_id: Uuid,
    pub contact_id: Option<Uuid>,
}

/// A stable channel-specific identifier of a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactIdentifier {
    pub kind: String,
    pub value: String,
}

impl ContactIdentifier {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Message lookups
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn exists_by_channel_message_id(
        &self,
        channel_message_id: &str,
    ) -> Result<bool, PortError>;
}

/// Use case recording an inbound message
#[async_trait]
pub trait InboundMessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Result<ProcessedMessage, PortError>;
}

/// Applies delivery acknowledgements to stored messages
#[async_trait]
pub trait MessageStatusUpdater: Send + Sync {
    /// Returns `PortError::NotFound` when no message has this channel id
    async fn update_delivery_status(
        &self,
        channel_message_id: &str,
        status: MessageDeliveryStatus,
    ) -> Result<(), PortError>;
}

/// Applies session status changes to channels
#[async_trait]
pub trait ChannelStatusUpdater: Send + Sync {
    async fn update_connection_state(
        &self,
        session: &str,
        state: ChannelConnectionState,
    ) -> Result<(), PortError>;
}

/// Stores auxiliary contact attributes
#[async_trait]
pub trait ContactIdentifierStore: Send + Sync {
    async fn save_identifiers(
        &self,
        contact_id: Uuid,
        identifiers: &[ContactIdentifier],
    ) -> Result<(), PortError>;
}
