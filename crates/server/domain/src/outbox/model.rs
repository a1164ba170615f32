//! Outbox Event Model
//!
//! Domain model for outbox events used in the Transactional Outbox Pattern.

use chrono::{DateTime, Utc};
use pulso_shared::queue_names::domain_event_queue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::DomainEvent;

/// Status of an outbox event
///
/// `pending -> processing -> processed | failed`. A failed event only returns
/// to `pending` through an explicit operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Committed, not yet claimed by a dispatcher
    Pending,
    /// Claimed by exactly one dispatcher
    Processing,
    /// Published to its queue
    Processed,
    /// Publishing failed; the error is kept in `last_error`
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// Error types for outbox operations
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    #[error("Notification listener error: {0}")]
    Listener(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Infrastructure error: {message}")]
    InfrastructureError { message: String },
}

/// A domain event recorded in the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: i32,
    /// Serialized domain event, published verbatim
    pub payload: serde_json::Value,
    /// Optional context such as correlation ids
    pub metadata: Option<serde_json::Value>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Create a new pending event
    pub fn pending(
        aggregate_id: Uuid,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            event_version: 1,
            payload,
            metadata: None,
            tenant_id: None,
            created_at: Utc::now(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            processed_at: None,
        }
    }

    /// Serialize a domain event into a pending outbox record
    pub fn from_domain_event<E: DomainEvent>(event: &E) -> Result<Self, OutboxError> {
        let payload = serde_json::to_value(event)?;
        let mut record = Self::pending(
            event.aggregate_id(),
            event.aggregate_type(),
            event.event_type(),
            payload,
        );
        record.event_version = event.event_version();
        record.tenant_id = event.tenant_id();
        record.metadata = event.metadata();
        Ok(record)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, OutboxStatus::Pending)
    }

    pub fn is_processed(&self) -> bool {
        matches!(self.status, OutboxStatus::Processed)
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.status, OutboxStatus::Failed)
    }

    /// Queue this event is dispatched to
    pub fn queue_name(&self) -> String {
        domain_event_queue(&self.event_type)
    }

    /// Bytes published to the queue
    pub fn payload_bytes(&self) -> Result<Vec<u8>, OutboxError> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    /// Get the age of the event
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct ContactCreated {
        contact_id: Uuid,
        name: String,
    }

    impl DomainEvent for ContactCreated {
        fn event_type(&self) -> &str {
            "contact.created"
        }

        fn aggregate_id(&self) -> Uuid {
            self.contact_id
        }

        fn aggregate_type(&self) -> &str {
            "contact"
        }

        fn tenant_id(&self) -> Option<String> {
            Some("tenant-1".to_string())
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Processed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("published".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn test_from_domain_event() {
        let contact_id = Uuid::new_v4();
        let event = ContactCreated {
            contact_id,
            name: "Ana".to_string(),
        };

        let record = OutboxEvent::from_domain_event(&event).unwrap();

        assert!(record.is_pending());
        assert_eq!(record.aggregate_id, contact_id);
        assert_eq!(record.aggregate_type, "contact");
        assert_eq!(record.event_type, "contact.created");
        assert_eq!(record.event_version, 1);
        assert_eq!(record.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(record.payload["name"], "Ana");
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn test_queue_name_is_derived_from_event_type() {
        let record = OutboxEvent::pending(
            Uuid::new_v4(),
            "message",
            "message.received",
            serde_json::json!({}),
        );
        assert_eq!(record.queue_name(), "domain.events.message.received");
    }

    #[test]
    fn test_payload_bytes_are_the_serialized_payload() {
        let payload = serde_json::json!({"a": 1});
        let record = OutboxEvent::pending(Uuid::new_v4(), "x", "y", payload.clone());
        let bytes = record.payload_bytes().unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(),
            payload
        );
    }
}
