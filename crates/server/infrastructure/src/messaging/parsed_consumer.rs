//! Consumer for the parsed message queue
//!
//! Messages land here when recording failed during raw processing. They are
//! handled again through the same message handler, now with the broker's
//! retry and dead-letter accounting.

use std::sync::Arc;

use async_trait::async_trait;
use pulso_server_application::webhooks::{MessageHandlingOutcome, WebhookMessageHandler};
use pulso_server_domain::queue::{ConsumerError, Delivery, MessageConsumer};
use pulso_server_domain::raw_event::{MessagePayload, ParsedEvent, WebhookEnvelope};
use tracing::{debug, info};

pub struct ParsedMessageConsumer {
    handler: Arc<WebhookMessageHandler>,
}

impl ParsedMessageConsumer {
    pub fn new(handler: Arc<WebhookMessageHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl MessageConsumer for ParsedMessageConsumer {
    async fn process(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let parsed: ParsedEvent = serde_json::from_slice(&delivery.body)
            .map_err(|e| ConsumerError::Parse(format!("invalid parsed event: {e}")))?;
        let envelope: WebhookEnvelope = serde_json::from_value(parsed.payload)
            .map_err(|e| ConsumerError::Parse(format!("invalid webhook envelope: {e}")))?;
        let payload: MessagePayload = envelope
            .payload_as()
            .map_err(|e| ConsumerError::Parse(e.to_string()))?;

        let session = if envelope.session.is_empty() {
            parsed.session_key.as_str()
        } else {
            envelope.session.as_str()
        };

        match self
            .handler
            .handle(session, &payload, envelope.payload.clone())
            .await
            .map_err(|e| ConsumerError::Processing(e.to_string()))?
        {
            MessageHandlingOutcome::Recorded(processed) => {
                info!(
                    raw_event_id = %parsed.raw_event_id,
                    message_id = %processed.message_id,
                    attempt = delivery.prior_attempts + 1,
                    "Parsed message recorded"
                );
            }
            MessageHandlingOutcome::DuplicateEcho => {
                debug!(raw_event_id = %parsed.raw_event_id, "Parsed message was an echo");
            }
        }
        Ok(())
    }
}
