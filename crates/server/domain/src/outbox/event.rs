//! Domain events that can be recorded in the outbox

use serde::Serialize;
use uuid::Uuid;

/// A domain event produced by an aggregate mutation
///
/// The serialized form of the implementing type becomes the outbox payload
/// and is published verbatim to `domain.events.<event_type>`.
pub trait DomainEvent: Serialize + Send + Sync {
    /// Dotted event type, e.g. `message.received`
    fn event_type(&self) -> &str;

    fn aggregate_id(&self) -> Uuid;

    fn aggregate_type(&self) -> &str;

    fn event_version(&self) -> i32 {
        1
    }

    fn tenant_id(&self) -> Option<String> {
        None
    }

    /// Correlation context carried alongside the payload
    fn metadata(&self) -> Option<serde_json::Value> {
        None
    }
}
