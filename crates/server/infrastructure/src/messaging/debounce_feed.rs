//! Feeds recorded inbound messages into the debouncer
//!
//! Consumes the `message.received` domain-event queue filled by the outbox
//! dispatcher. Each event becomes a [`BufferedMessage`] keyed by
//! `contact:channelType:session`.

use std::sync::Arc;

use async_trait::async_trait;
use pulso_server_application::debounce::{MessageDebouncer, WindowDebouncer};
use pulso_server_domain::debounce::{BufferedMessage, SessionKey};
use pulso_server_domain::queue::{ConsumerError, Delivery, MessageConsumer};
use tracing::{debug, error};

use crate::persistence::postgres::MessageRecordedEvent;

/// Channel type used in session keys when none is configured
pub const DEFAULT_CHANNEL_TYPE: &str = "whatsapp";

/// The debouncing strategy messages are pushed into
#[derive(Clone)]
pub enum DebounceTarget {
    Wait(Arc<MessageDebouncer>),
    Window(Arc<WindowDebouncer>),
}

pub struct DebounceFeedConsumer {
    target: DebounceTarget,
    channel_type: String,
}

impl DebounceFeedConsumer {
    pub fn new(target: DebounceTarget) -> Self {
        Self {
            target,
            channel_type: DEFAULT_CHANNEL_TYPE.to_string(),
        }
    }

    pub fn with_channel_type(mut self, channel_type: impl Into<String>) -> Self {
        self.channel_type = channel_type.into();
        self
    }

    fn to_buffered(&self, event: &MessageRecordedEvent) -> (SessionKey, BufferedMessage) {
        let contact_id = event.contact_id.to_string();
        let key = SessionKey::new(contact_id.clone(), self.channel_type.clone(), event.session.clone());
        let mut message = BufferedMessage::text(
            event.channel_message_id.clone(),
            event.text.clone().unwrap_or_default(),
            event.sent_at.timestamp_millis(),
        );
        if event.has_media {
            message.message_type = "media".to_string();
        }
        message.from_contact = !event.from_me;
        message.contact_id = contact_id;
        message.session_id = event.session.clone();
        (key, message)
    }
}

#[async_trait]
impl MessageConsumer for DebounceFeedConsumer {
    async fn process(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let event: MessageRecordedEvent = serde_json::from_slice(&delivery.body)
            .map_err(|e| ConsumerError::Parse(format!("invalid message event: {e}")))?;
        if event.from_me {
            debug!(channel_message_id = %event.channel_message_id, "Skipping outgoing message");
            return Ok(());
        }
        let (key, message) = self.to_buffered(&event);

        match &self.target {
            DebounceTarget::Window(debouncer) => {
                debouncer
                    .push(&key, message)
                    .await
                    .map_err(|e| ConsumerError::Processing(e.to_string()))?;
            }
            DebounceTarget::Wait(debouncer) => {
                // Pushes block until the conversation is quiet; keep them off the consumer loop
                let debouncer = debouncer.clone();
                tokio::spawn(async move {
                    if let Err(e) = debouncer.push(&key, message).await {
                        error!(session_key = %key, error = %e, "Debounce push failed");
                    }
                });
            }
        }
        Ok(())
    }
}
