//! Centralized queue name constants
//!
//! Single source of truth for every queue declared on the broker, so that
//! publishers and consumers can never disagree on a name.
//!
//! ## Naming Convention
//! - Webhook ingestion: `webhooks.raw`, `webhooks.parsed.{kind}`, `webhooks.parse_errors`
//! - Outbox dispatch: `domain.events.{event_type}`
//! - Dead-letter queues: `{queue}.dlq`
//!
//! ## Usage
//! ```rust
//! use pulso_shared::queue_names::{dlq_name, domain_event_queue, RAW_EVENTS};
//!
//! assert_eq!(dlq_name(RAW_EVENTS), "webhooks.raw.dlq");
//! assert_eq!(domain_event_queue("contact.created"), "domain.events.contact.created");
//! ```

/// Suffix appended to a queue name to obtain its dead-letter queue
pub const DLQ_SUFFIX: &str = ".dlq";

/// Raw webhook intake queue
pub const RAW_EVENTS: &str = "webhooks.raw";

/// Retry ceiling for the raw intake queue
pub const RAW_EVENTS_MAX_RETRIES: u32 = 3;

/// Parse-error dead-letter queue (structured ParseError records)
pub const PARSE_ERRORS: &str = "webhooks.parse_errors";

/// Retry ceiling for the parse-errors queue
pub const PARSE_ERRORS_MAX_RETRIES: u32 = 5;

/// Retry ceiling for the typed parsed-output queues
pub const PARSED_MAX_RETRIES: u32 = 3;

/// Typed parsed-output queues
pub mod parsed {
    /// Message events
    pub const MESSAGE: &str = "webhooks.parsed.message";
    /// Call events
    pub const CALL: &str = "webhooks.parsed.call";
    /// Presence events
    pub const PRESENCE: &str = "webhooks.parsed.presence";
    /// Group events
    pub const GROUP: &str = "webhooks.parsed.group";
    /// Label events
    pub const LABEL: &str = "webhooks.parsed.label";
    /// Catch-all for event types without a dedicated queue
    pub const UNKNOWN: &str = "webhooks.parsed.unknown";

    /// All typed parsed-output queues
    pub const ALL: [&str; 6] = [MESSAGE, CALL, PRESENCE, GROUP, LABEL, UNKNOWN];
}

/// Outbound webhook delivery queue (consumed by the external delivery workflow)
pub const WEBHOOK_OUTBOUND: &str = "webhooks.outbound";

/// Retry ceiling for the outbound webhook delivery queue
pub const WEBHOOK_OUTBOUND_MAX_RETRIES: u32 = 3;

/// Queue receiving debounced message batches for enrichment
pub const DEBOUNCED_BATCHES: &str = "debounce.batches";

/// Prefix of the outbox dispatch queues
pub const DOMAIN_EVENTS_PREFIX: &str = "domain.events";

/// Name of the dead-letter queue paired with `queue`
pub fn dlq_name(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

/// Outbox dispatch queue for a domain event type
pub fn domain_event_queue(event_type: &str) -> String {
    format!("{}.{}", DOMAIN_EVENTS_PREFIX, event_type)
}
