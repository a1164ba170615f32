//! Typed view of the chat platform webhook envelope

use chrono::{DateTime, TimeZone, Utc};
use pulso_shared::queue_names::parsed;
use serde::{Deserialize, Serialize};

use crate::messaging::{
    ChannelConnectionState, ContactIdentifier, InboundMessage, MessageDeliveryStatus,
};

/// Errors building typed values from webhook payloads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("Unknown acknowledgement code: {0}")]
    UnknownAckCode(i32),

    #[error("Invalid {event} payload: {message}")]
    InvalidPayload { event: String, message: String },
}

/// Webhook envelope as posted by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    /// Milliseconds since epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Event type discriminator
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub me: Option<serde_json::Value>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn event_type(&self) -> WebhookEventType {
        WebhookEventType::from_name(&self.event)
    }

    /// Decode the payload as `T`
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, WebhookError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| WebhookError::InvalidPayload {
            event: self.event.clone(),
            message: e.to_string(),
        })
    }
}

/// Event types the processor distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookEventType {
    /// Legacy narrow message event, superseded by [`WebhookEventType::MessageAny`]
    Message,
    /// Every message, including the ones sent by the channel identity
    MessageAny,
    MessageAck,
    SessionStatus,
    Call,
    Presence,
    Group,
    Label,
    Unknown,
}

impl WebhookEventType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "message" => WebhookEventType::Message,
            "message.any" => WebhookEventType::MessageAny,
            "message.ack" => WebhookEventType::MessageAck,
            "session.status" => WebhookEventType::SessionStatus,
            "presence.update" => WebhookEventType::Presence,
            _ if name.starts_with("call.") => WebhookEventType::Call,
            _ if name.starts_with("group.") => WebhookEventType::Group,
            _ if name.starts_with("label.") => WebhookEventType::Label,
            _ => WebhookEventType::Unknown,
        }
    }

    /// Typed queue events of this kind are published to, if any
    pub fn parsed_queue(&self) -> Option<&'static str> {
        match self {
            WebhookEventType::Message | WebhookEventType::MessageAny => Some(parsed::MESSAGE),
            WebhookEventType::Call => Some(parsed::CALL),
            WebhookEventType::Presence => Some(parsed::PRESENCE),
            WebhookEventType::Group => Some(parsed::GROUP),
            WebhookEventType::Label => Some(parsed::LABEL),
            WebhookEventType::Unknown => Some(parsed::UNKNOWN),
            WebhookEventType::MessageAck | WebhookEventType::SessionStatus => None,
        }
    }
}

/// Payload of `message` / `message.any`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    /// Seconds since epoch
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default, rename = "fromMe")]
    pub from_me: bool,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, rename = "hasMedia")]
    pub has_media: bool,
    #[serde(default, rename = "_data")]
    pub data: Option<serde_json::Value>,
}

impl MessagePayload {
    /// The chat counterpart: recipient of our own messages, sender otherwise
    pub fn remote_id(&self) -> &str {
        match (&self.to, self.from_me) {
            (Some(to), true) => to,
            _ => &self.from,
        }
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn to_inbound(&self, session: &str, raw_payload: serde_json::Value) -> InboundMessage {
        InboundMessage {
            channel_message_id: self.id.clone(),
            session: session.to_string(),
            from_me: self.from_me,
            remote_id: self.remote_id().to_string(),
            text: self.body.clone().filter(|b| !b.is_empty()),
            has_media: self.has_media,
            sent_at: self.sent_at(),
            raw_payload,
        }
    }

    /// Stable identifiers of the chat counterpart carried by this message
    pub fn contact_identifiers(&self) -> Vec<ContactIdentifier> {
        let mut identifiers = Vec::new();
        let remote = self.remote_id();

        if let Some((user, server)) = remote.split_once('@') {
            match server {
                "c.us" | "s.whatsapp.net" => {
                    identifiers.push(ContactIdentifier::new("whatsapp_jid", remote));
                    if user.chars().all(|c| c.is_ascii_digit()) && !user.is_empty() {
                        identifiers.push(ContactIdentifier::new("whatsapp_phone", user));
                    }
                }
                "lid" => identifiers.push(ContactIdentifier::new("whatsapp_lid", remote)),
                _ => {}
            }
        }

        if !self.from_me {
            let push_name = self
                .data
                .as_ref()
                .and_then(|d| d.get("notifyName"))
                .and_then(|n| n.as_str())
                .filter(|n| !n.is_empty());
            if let Some(name) = push_name {
                identifiers.push(ContactIdentifier::new("whatsapp_push_name", name));
            }
        }

        identifiers
    }
}

/// Payload of `message.ack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub ack: i32,
    #[serde(default, rename = "ackName")]
    pub ack_name: Option<String>,
}

/// Ordinal delivery state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Failed,
    Pending,
    Server,
    Device,
    Read,
    Played,
}

impl TryFrom<i32> for AckCode {
    type Error = WebhookError;

    fn try_from(code: i32) -> Result<Self, WebhookError> {
        match code {
            -1 => Ok(AckCode::Failed),
            0 => Ok(AckCode::Pending),
            1 => Ok(AckCode::Server),
            2 => Ok(AckCode::Device),
            3 => Ok(AckCode::Read),
            4 => Ok(AckCode::Played),
            other => Err(WebhookError::UnknownAckCode(other)),
        }
    }
}

impl AckCode {
    /// Status to store, `None` for codes that must not touch stored state
    pub fn delivery_status(&self) -> Option<MessageDeliveryStatus> {
        match self {
            AckCode::Failed | AckCode::Pending => None,
            AckCode::Server => Some(MessageDeliveryStatus::Sent),
            AckCode::Device => Some(MessageDeliveryStatus::Delivered),
            AckCode::Read => Some(MessageDeliveryStatus::Read),
            AckCode::Played => Some(MessageDeliveryStatus::Played),
        }
    }
}

/// Payload of `session.status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusPayload {
    pub status: String,
}

impl SessionStatusPayload {
    pub fn connection_state(&self) -> Option<ChannelConnectionState> {
        match self.status.as_str() {
            "STARTING" => Some(ChannelConnectionState::Connecting),
            "SCAN_QR_CODE" => Some(ChannelConnectionState::AwaitingQrScan),
            "WORKING" => Some(ChannelConnectionState::Connected),
            "STOPPED" => Some(ChannelConnectionState::Disconnected),
            "FAILED" => Some(ChannelConnectionState::Failed),
            _ => None,
        }
    }
}
