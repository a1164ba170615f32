//! Raw Event Bus
//!
//! Durable-publish wrapper over the queue transport for webhook ingestion.
//! `publish_raw_event` never fails its caller: an event that cannot be
//! serialized is replaced by a failure envelope, and a broker failure is
//! logged at error level and swallowed. The internal hops
//! (`publish_processed_event`, `publish_parse_error`) propagate errors.

use std::sync::Arc;

use chrono::Utc;
use pulso_server_domain::queue::{QueueTransport, TransportError, raw_event_topology};
use pulso_server_domain::raw_event::{
    ParseError, ParsedEvent, RawEvent, RawEventError, RawEventFailureEnvelope,
};
use pulso_shared::queue_names::{PARSE_ERRORS, RAW_EVENTS};
use serde::Serialize;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::event_log::{EventLogEntry, EventLogOutcome, EventLogWriter};

/// Publisher for the raw webhook pipeline
#[derive(Clone)]
pub struct RawEventBus {
    transport: Arc<dyn QueueTransport>,
    event_log: Option<EventLogWriter>,
}

impl RawEventBus {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            transport,
            event_log: None,
        }
    }

    /// Record a log entry for every raw event published
    pub fn with_event_log(mut self, writer: EventLogWriter) -> Self {
        self.event_log = Some(writer);
        self
    }

    /// Declare raw intake, the typed parsed queues and the parse-error queue
    pub async fn setup_raw_event_queues(&self) -> Result<(), TransportError> {
        self.transport.setup_all_queues(&raw_event_topology()).await
    }

    /// Queue a received webhook; never reports failure to the caller
    #[instrument(skip(self, event), fields(raw_event_id = %event.id, session_key = %event.session_key))]
    pub async fn publish_raw_event(&self, event: &RawEvent) {
        let intake = Intake {
            id: event.id,
            session_key: &event.session_key,
            source: &event.source,
            body_size: event.body.len(),
        };
        self.publish_to_intake(event, intake).await;
    }

    /// Publish `value` to raw intake, substituting a failure envelope when it
    /// cannot be encoded, then log the outcome
    async fn publish_to_intake<T: Serialize>(&self, value: &T, intake: Intake<'_>) {
        let (body, mut outcome) = encode_or_substitute(value, intake.id, intake.session_key);

        if let Err(e) = self.transport.publish(RAW_EVENTS, &body).await {
            error!(
                raw_event_id = %intake.id,
                session_key = %intake.session_key,
                error = %e,
                "Failed to publish raw event, event dropped"
            );
            outcome = EventLogOutcome::Lost;
        } else {
            debug!(raw_event_id = %intake.id, bytes = body.len(), "Raw event published");
        }

        if let Some(writer) = &self.event_log {
            writer.record(EventLogEntry {
                raw_event_id: intake.id,
                session_key: intake.session_key.to_string(),
                source: intake.source.to_string(),
                queue: RAW_EVENTS.to_string(),
                body_size: intake.body_size,
                outcome,
                recorded_at: Utc::now(),
            });
        }
    }

    /// Forward a parsed event to its typed queue
    pub async fn publish_processed_event(
        &self,
        queue: &str,
        event: &ParsedEvent,
    ) -> Result<(), RawEventError> {
        let body = serde_json::to_vec(event)?;
        self.transport.publish(queue, &body).await?;
        debug!(raw_event_id = %event.raw_event_id, queue, event_type = %event.event_type, "Parsed event published");
        Ok(())
    }

    /// Dead-letter a parse failure to the parse-error queue
    pub async fn publish_parse_error(&self, parse_error: &ParseError) -> Result<(), RawEventError> {
        let body = serde_json::to_vec(parse_error)?;
        self.transport.publish(PARSE_ERRORS, &body).await?;
        debug!(
            raw_event_id = %parse_error.raw_event_id,
            error_type = %parse_error.error_type,
            "Parse error published"
        );
        Ok(())
    }
}

/// Identity of an intake publish, for logging
#[derive(Debug, Clone, Copy)]
struct Intake<'a> {
    id: Uuid,
    session_key: &'a str,
    source: &'a str,
    body_size: usize,
}

/// Serialize `value`, falling back to a failure envelope
fn encode_or_substitute<T: Serialize>(
    value: &T,
    id: Uuid,
    session_key: &str,
) -> (Vec<u8>, EventLogOutcome) {
    match serde_json::to_vec(value) {
        Ok(body) => (body, EventLogOutcome::Published),
        Err(e) => {
            error!(raw_event_id = %id, session_key, error = %e, "Raw event serialization failed, publishing failure envelope");
            let envelope = RawEventFailureEnvelope::new(id, session_key);
            // Uuid and String fields only
            let body = serde_json::to_vec(&envelope).unwrap_or_default();
            (body, EventLogOutcome::Substituted)
        }
    }
}
