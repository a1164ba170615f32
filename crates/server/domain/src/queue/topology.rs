//! Queue topology declared at startup

use pulso_shared::queue_names::{
    self, PARSE_ERRORS, PARSE_ERRORS_MAX_RETRIES, PARSED_MAX_RETRIES, RAW_EVENTS,
    RAW_EVENTS_MAX_RETRIES, WEBHOOK_OUTBOUND, WEBHOOK_OUTBOUND_MAX_RETRIES,
};

/// A queue and, when dead-lettered, its retry ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub max_retries: Option<u32>,
}

impl QueueSpec {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: None,
        }
    }

    pub fn with_dlq(name: impl Into<String>, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            max_retries: Some(max_retries),
        }
    }
}

/// Queues owned by webhook ingestion: raw intake, typed parsed outputs and parse errors
pub fn raw_event_topology() -> Vec<QueueSpec> {
    let mut specs = vec![QueueSpec::with_dlq(RAW_EVENTS, RAW_EVENTS_MAX_RETRIES)];
    specs.extend(
        queue_names::parsed::ALL
            .iter()
            .map(|name| QueueSpec::with_dlq(*name, PARSED_MAX_RETRIES)),
    );
    specs.push(QueueSpec::with_dlq(PARSE_ERRORS, PARSE_ERRORS_MAX_RETRIES));
    specs
}

/// Every statically known queue of the server
///
/// Outbox dispatch queues (`domain.events.<type>`) are declared lazily by the
/// dispatcher the first time an event type is seen.
pub fn standard_topology() -> Vec<QueueSpec> {
    let mut specs = raw_event_topology();
    specs.push(QueueSpec::with_dlq(
        WEBHOOK_OUTBOUND,
        WEBHOOK_OUTBOUND_MAX_RETRIES,
    ));
    specs.push(QueueSpec::plain(queue_names::DEBOUNCED_BATCHES));
    specs
}
