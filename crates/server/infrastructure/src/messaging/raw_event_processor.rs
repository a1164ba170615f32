//! Raw Event Processor
//!
//! Consumes the raw intake queue. Each delivery is decoded into a
//! [`RawEvent`] and its webhook envelope, then routed on the typed event:
//!
//! - `message.any`: recorded through the message handler; on failure the
//!   event is republished to the parsed message queue
//! - `message`: legacy duplicate of `message.any`, ignored
//! - `message.ack`: delivery status update, dropped when the message is unknown
//! - `session.status`: channel connectivity update
//! - everything else: forwarded to its typed parsed queue
//!
//! Decode failures become [`ParseError`] records on the parse-error queue and
//! are still reported to the transport, which keeps retry accounting intact.
//! A panic anywhere in processing is caught once per delivery and handled
//! the same way.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use pulso_server_application::webhooks::{MessageHandlingOutcome, WebhookMessageHandler};
use pulso_server_domain::messaging::{ChannelStatusUpdater, MessageStatusUpdater, PortError};
use pulso_server_domain::queue::{ConsumerError, Delivery, MessageConsumer};
use pulso_server_domain::raw_event::{
    AckCode, AckPayload, MessagePayload, ParseError, ParseErrorKind, ParsedEvent, RawEvent,
    RawEventFailureEnvelope, SessionStatusPayload, WebhookEnvelope, WebhookEventType,
};
use pulso_shared::queue_names::parsed;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::raw_event_bus::RawEventBus;

/// Collaborators the processor routes into
#[derive(Clone)]
pub struct WebhookPorts {
    pub messages: Arc<WebhookMessageHandler>,
    pub message_status: Arc<dyn MessageStatusUpdater>,
    pub channel_status: Arc<dyn ChannelStatusUpdater>,
}

pub struct RawEventProcessor {
    bus: RawEventBus,
    ports: WebhookPorts,
}

impl RawEventProcessor {
    pub fn new(bus: RawEventBus, ports: WebhookPorts) -> Self {
        Self { bus, ports }
    }

    async fn process_raw(&self, body: &[u8]) -> Result<(), ConsumerError> {
        let raw: RawEvent = match serde_json::from_slice(body) {
            Ok(raw) => raw,
            Err(e) => {
                let id = recover_raw_event_id(body);
                return Err(self
                    .reject(id, ParseErrorKind::WebhookParse, format!("invalid raw event: {e}"), body)
                    .await);
            }
        };

        let envelope: WebhookEnvelope = match serde_json::from_slice(&raw.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Err(self
                    .reject(raw.id, ParseErrorKind::WebhookParse, format!("invalid webhook: {e}"), &raw.body)
                    .await);
            }
        };

        if envelope.event.trim().is_empty() {
            return Err(self
                .reject(raw.id, ParseErrorKind::MissingEventType, "webhook has no event type", &raw.body)
                .await);
        }

        self.route(&raw, &envelope).await
    }

    async fn route(&self, raw: &RawEvent, envelope: &WebhookEnvelope) -> Result<(), ConsumerError> {
        let event_type = envelope.event_type();
        debug!(raw_event_id = %raw.id, event = %envelope.event, "Routing webhook");

        match event_type {
            WebhookEventType::Message => {
                debug!(raw_event_id = %raw.id, "Ignoring legacy message event");
                Ok(())
            }
            WebhookEventType::MessageAny => self.handle_message(raw, envelope).await,
            WebhookEventType::MessageAck => self.handle_ack(raw, envelope).await,
            WebhookEventType::SessionStatus => self.handle_session_status(raw, envelope).await,
            WebhookEventType::Call
            | WebhookEventType::Presence
            | WebhookEventType::Group
            | WebhookEventType::Label
            | WebhookEventType::Unknown => {
                let queue = event_type.parsed_queue().unwrap_or(parsed::UNKNOWN);
                self.forward(raw, envelope, queue).await
            }
        }
    }

    async fn handle_message(
        &self,
        raw: &RawEvent,
        envelope: &WebhookEnvelope,
    ) -> Result<(), ConsumerError> {
        let payload: MessagePayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                return Err(self
                    .reject(raw.id, ParseErrorKind::WebhookParse, e.to_string(), &raw.body)
                    .await);
            }
        };

        let session = session_of(raw, envelope);
        match self
            .ports
            .messages
            .handle(session, &payload, envelope.payload.clone())
            .await
        {
            Ok(MessageHandlingOutcome::Recorded(processed)) => {
                debug!(raw_event_id = %raw.id, message_id = %processed.message_id, "Message recorded");
                Ok(())
            }
            Ok(MessageHandlingOutcome::DuplicateEcho) => Ok(()),
            Err(e) => {
                warn!(
                    raw_event_id = %raw.id,
                    channel_message_id = %payload.id,
                    error = %e,
                    "Message handling failed, republishing to parsed queue"
                );
                self.forward(raw, envelope, parsed::MESSAGE).await
            }
        }
    }

    async fn handle_ack(&self, raw: &RawEvent, envelope: &WebhookEnvelope) -> Result<(), ConsumerError> {
        let payload: AckPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                return Err(self
                    .reject(raw.id, ParseErrorKind::WebhookParse, e.to_string(), &raw.body)
                    .await);
            }
        };
        let code = match AckCode::try_from(payload.ack) {
            Ok(code) => code,
            Err(e) => {
                return Err(self
                    .reject(raw.id, ParseErrorKind::WebhookParse, e.to_string(), &raw.body)
                    .await);
            }
        };

        let Some(status) = code.delivery_status() else {
            debug!(channel_message_id = %payload.id, ?code, "Acknowledgement leaves message state unchanged");
            return Ok(());
        };

        match self
            .ports
            .message_status
            .update_delivery_status(&payload.id, status)
            .await
        {
            Ok(()) => Ok(()),
            Err(PortError::NotFound(_)) => {
                debug!(channel_message_id = %payload.id, "Acknowledgement for unknown message dropped");
                Ok(())
            }
            Err(e) => Err(ConsumerError::Processing(e.to_string())),
        }
    }

    async fn handle_session_status(
        &self,
        raw: &RawEvent,
        envelope: &WebhookEnvelope,
    ) -> Result<(), ConsumerError> {
        let payload: SessionStatusPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                return Err(self
                    .reject(raw.id, ParseErrorKind::WebhookParse, e.to_string(), &raw.body)
                    .await);
            }
        };

        let Some(state) = payload.connection_state() else {
            debug!(status = %payload.status, "Ignoring unmapped session status");
            return Ok(());
        };

        self.ports
            .channel_status
            .update_connection_state(session_of(raw, envelope), state)
            .await
            .map_err(|e| ConsumerError::Processing(e.to_string()))
    }

    async fn forward(
        &self,
        raw: &RawEvent,
        envelope: &WebhookEnvelope,
        queue: &str,
    ) -> Result<(), ConsumerError> {
        let payload =
            serde_json::to_value(envelope).map_err(|e| ConsumerError::Processing(e.to_string()))?;
        let parsed = ParsedEvent {
            raw_event_id: raw.id,
            event_type: envelope.event.clone(),
            session_key: raw.session_key.clone(),
            payload,
            parsed_at: Utc::now(),
        };
        self.bus
            .publish_processed_event(queue, &parsed)
            .await
            .map_err(|e| ConsumerError::Processing(e.to_string()))
    }

    /// Publish a parse error and build the failure reported to the transport
    async fn reject(
        &self,
        raw_event_id: Uuid,
        kind: ParseErrorKind,
        message: impl Into<String>,
        body: &[u8],
    ) -> ConsumerError {
        let parse_error = ParseError::new(raw_event_id, kind, message, body);
        warn!(
            raw_event_id = %raw_event_id,
            error_type = %kind,
            error = %parse_error.error,
            "Raw event rejected"
        );
        if let Err(e) = self.bus.publish_parse_error(&parse_error).await {
            error!(raw_event_id = %raw_event_id, error = %e, "Failed to publish parse error");
        }
        ConsumerError::Parse(parse_error.error)
    }
}

#[async_trait]
impl MessageConsumer for RawEventProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        match AssertUnwindSafe(self.process_raw(&delivery.body))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(queue = %delivery.queue, panic = %message, "Raw event processing panicked");
                let id = recover_raw_event_id(&delivery.body);
                self.reject(id, ParseErrorKind::Panic, format!("panic: {message}"), &delivery.body)
                    .await;
                Err(ConsumerError::Panic(message))
            }
        }
    }
}

fn session_of<'a>(raw: &'a RawEvent, envelope: &'a WebhookEnvelope) -> &'a str {
    if envelope.session.is_empty() {
        &raw.session_key
    } else {
        &envelope.session
    }
}

/// Best-effort id of an undecodable delivery, nil when none is readable
fn recover_raw_event_id(body: &[u8]) -> Uuid {
    if let Ok(raw) = serde_json::from_slice::<RawEvent>(body) {
        return raw.id;
    }
    serde_json::from_slice::<RawEventFailureEnvelope>(body)
        .map(|envelope| envelope.id)
        .unwrap_or_else(|_| Uuid::nil())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
