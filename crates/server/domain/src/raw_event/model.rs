//! Raw webhook events and their parse outcomes

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::TransportError;

/// Metadata key flagging a stand-in published after a serialization failure
pub const MARSHAL_FAILURE_MARKER: &str = "raw_event_marshal_failed";

/// Errors raised while publishing raw-event pipeline records
#[derive(Debug, thiserror::Error)]
pub enum RawEventError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A webhook exactly as received, before any parsing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Channel session the webhook was delivered for
    pub session_key: String,
    /// Untouched request body
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Receiver that produced the event, e.g. `waha`
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RawEvent {
    pub fn new(session_key: impl Into<String>, body: Vec<u8>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_key: session_key.into(),
            body,
            headers: HashMap::new(),
            source: source.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Minimal record published in place of a RawEvent that could not be serialized
///
/// Carries nothing that can fail to serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventFailureEnvelope {
    pub id: Uuid,
    pub session_key: String,
    pub error: String,
}

impl RawEventFailureEnvelope {
    pub fn new(id: Uuid, session_key: impl Into<String>) -> Self {
        Self {
            id,
            session_key: session_key.into(),
            error: MARSHAL_FAILURE_MARKER.to_string(),
        }
    }
}

/// Why a raw event could not be turned into a typed webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// The event or its webhook envelope is not valid
    WebhookParse,
    /// The envelope has no event type discriminator
    MissingEventType,
    /// Processing panicked
    Panic,
}

impl ParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorKind::WebhookParse => "webhook_parse",
            ParseErrorKind::MissingEventType => "missing_event_type",
            ParseErrorKind::Panic => "panic",
        }
    }
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record of a raw event that failed parsing or panicked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// Id of the raw event, nil when even that could not be recovered
    pub raw_event_id: Uuid,
    pub error: String,
    pub error_type: ParseErrorKind,
    pub occurred_at: DateTime<Utc>,
    pub raw_body: String,
}

impl ParseError {
    pub fn new(
        raw_event_id: Uuid,
        error_type: ParseErrorKind,
        error: impl Into<String>,
        raw_body: &[u8],
    ) -> Self {
        Self {
            raw_event_id,
            error: error.into(),
            error_type,
            occurred_at: Utc::now(),
            raw_body: String::from_utf8_lossy(raw_body).into_owned(),
        }
    }
}

/// A raw event after successful parsing, as published to a typed queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub raw_event_id: Uuid,
    pub event_type: String,
    pub session_key: String,
    /// The webhook envelope
    pub payload: serde_json::Value,
    pub parsed_at: DateTime<Utc>,
}

mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
