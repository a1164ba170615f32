//! Debounce buffers: keys, buffered fragments and the per-push decision

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A message fragment waiting in a conversation buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub message_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp_millis: i64,
    /// Written by the contact rather than by an agent
    pub from_contact: bool,
    pub contact_id: String,
    pub session_id: String,
    /// When the debouncer buffered it, by the debouncer's clock
    #[serde(default)]
    pub buffered_at_millis: i64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl BufferedMessage {
    pub fn text(
        message_id: impl Into<String>,
        text: impl Into<String>,
        timestamp_millis: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            text: text.into(),
            message_type: "text".to_string(),
            timestamp_millis,
            from_contact: true,
            contact_id: String::new(),
            session_id: String::new(),
            buffered_at_millis: 0,
            metadata: HashMap::new(),
        }
    }

    /// Whether this buffer head has sat longer than any live owner would keep it
    pub fn is_stranded(&self, now_millis: i64, ownership_timeout: Duration) -> bool {
        now_millis.saturating_sub(self.buffered_at_millis) >= ownership_timeout.as_millis() as i64
    }
}

/// Conversation key, rendered as `contactID:channelType:channelID`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub contact_id: String,
    pub channel_type: String,
    pub channel_id: String,
}

impl SessionKey {
    pub fn new(
        contact_id: impl Into<String>,
        channel_type: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.contact_id, self.channel_type, self.channel_id)
    }
}

impl std::str::FromStr for SessionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(contact), Some(channel_type), Some(channel))
                if !contact.is_empty() && !channel_type.is_empty() && !channel.is_empty() =>
            {
                Ok(SessionKey::new(contact, channel_type, channel))
            }
            _ => Err(format!("invalid session key '{}'", s)),
        }
    }
}

/// Outcome of evaluating a buffer for the message just pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    /// Another push owns this buffer, or it was already flushed
    Ignore,
    /// The conversation went quiet: flush now
    Proceed,
    /// Still receiving fragments: sleep and re-evaluate
    Wait,
}

impl DebounceDecision {
    /// Decide for `message_id` against the current buffer contents
    ///
    /// Only the push whose message is the buffer head owns the wait loop.
    /// Buffer order is append order; recency uses the newest timestamp.
    pub fn evaluate(
        buffer: &[BufferedMessage],
        message_id: &str,
        now_millis: i64,
        wait: Duration,
    ) -> Self {
        let Some(first) = buffer.first() else {
            return DebounceDecision::Ignore;
        };
        if first.message_id != message_id {
            return DebounceDecision::Ignore;
        }

        let newest = buffer
            .iter()
            .map(|m| m.timestamp_millis)
            .max()
            .unwrap_or(first.timestamp_millis);
        let quiet_for = now_millis.saturating_sub(newest);

        if quiet_for >= wait.as_millis() as i64 {
            DebounceDecision::Proceed
        } else {
            DebounceDecision::Wait
        }
    }
}

/// Order a batch by arrival timestamp; ties keep buffer order
pub fn sort_by_timestamp(messages: &mut [BufferedMessage]) {
    messages.sort_by_key(|m| m.timestamp_millis);
}

/// Source of the current time for debounce decisions
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
