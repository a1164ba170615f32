//! Webhook Message Use Case
//!
//! Records `message.any` webhooks. A self-sent message whose channel id is
//! already stored is an echo of our own send and is skipped; a self-sent
//! message we have never seen came from another device of the same identity
//! and is recorded like any other.

use std::sync::Arc;

use pulso_server_domain::messaging::{
    ContactIdentifierStore, InboundMessageHandler, MessageRepository, PortError, ProcessedMessage,
};
use pulso_server_domain::raw_event::MessagePayload;
use tracing::{debug, warn};

/// What happened to a message webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageHandlingOutcome {
    Recorded(ProcessedMessage),
    /// Echo of a message the system already recorded
    DuplicateEcho,
}

pub struct WebhookMessageHandler {
    messages: Arc<dyn MessageRepository>,
    recorder: Arc<dyn InboundMessageHandler>,
    identifiers: Arc<dyn ContactIdentifierStore>,
}

impl WebhookMessageHandler {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        recorder: Arc<dyn InboundMessageHandler>,
        identifiers: Arc<dyn ContactIdentifierStore>,
    ) -> Self {
        Self {
            messages,
            recorder,
            identifiers,
        }
    }

    pub async fn handle(
        &self,
        session: &str,
        payload: &MessagePayload,
        raw_payload: serde_json::Value,
    ) -> Result<MessageHandlingOutcome, PortError> {
        if payload.from_me && self.messages.exists_by_channel_message_id(&payload.id).await? {
            debug!(channel_message_id = %payload.id, session, "Skipping echo of recorded message");
            return Ok(MessageHandlingOutcome::DuplicateEcho);
        }

        let processed = self
            .recorder
            .handle(payload.to_inbound(session, raw_payload))
            .await?;

        if let Some(contact_id) = processed.contact_id {
            let identifiers = payload.contact_identifiers();
            if !identifiers.is_empty() {
                if let Err(e) = self.identifiers.save_identifiers(contact_id, &identifiers).await {
                    warn!(%contact_id, error = %e, "Failed to store contact identifiers");
                }
            }
        }

        Ok(MessageHandlingOutcome::Recorded(processed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pulso_server_domain::messaging::{ContactIdentifier, InboundMessage};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Message table keyed by channel message id
    #[derive(Default)]
    struct MemoryMessages {
        stored: Mutex<HashMap<String, Uuid>>,
        contact_id: Option<Uuid>,
        fail: bool,
    }

    #[async_trait]
    impl MessageRepository for MemoryMessages {
        async fn exists_by_channel_message_id(&self, id: &str) -> Result<bool, PortError> {
            Ok(self.stored.lock().unwrap().contains_key(id))
        }
    }

    #[async_trait]
    impl InboundMessageHandler for MemoryMessages {
        async fn handle(&self, message: InboundMessage) -> Result<ProcessedMessage, PortError> {
            if self.fail {
                return Err(PortError::Storage("db down".to_string()));
            }
            let message_id = *self
                .stored
                .lock()
                .unwrap()
                .entry(message.channel_message_id)
                .or_insert_with(Uuid::new_v4);
            Ok(ProcessedMessage {
                message_id,
                contact_id: self.contact_id,
            })
        }
    }

    #[derive(Default)]
    struct MemoryIdentifiers {
        saved: Mutex<Vec<(Uuid, Vec<ContactIdentifier>)>>,
        fail: bool,
    }

    #[async_trait]
    impl ContactIdentifierStore for MemoryIdentifiers {
        async fn save_identifiers(
            &self,
            contact_id: Uuid,
            identifiers: &[ContactIdentifier],
        ) -> Result<(), PortError> {
            if self.fail {
                return Err(PortError::Storage("identifiers unavailable".to_string()));
            }
            self.saved
                .lock()
                .unwrap()
                .push((contact_id, identifiers.to_vec()));
            Ok(())
        }
    }

    fn payload(id: &str, from_me: bool) -> MessagePayload {
        serde_json::from_value(json!({
            "id": id,
            "timestamp": 1_700_000_000,
            "from": "34600111222@c.us",
            "to": "34600999888@c.us",
            "fromMe": from_me,
            "body": "hola",
            "_data": {"notifyName": "Ana"}
        }))
        .unwrap()
    }

    fn handler(
        messages: Arc<MemoryMessages>,
        identifiers: Arc<MemoryIdentifiers>,
    ) -> WebhookMessageHandler {
        WebhookMessageHandler::new(messages.clone(), messages, identifiers)
    }

    #[tokio::test]
    async fn test_inbound_message_recorded_with_identifiers() {
        let contact_id = Uuid::new_v4();
        let messages = Arc::new(MemoryMessages {
            contact_id: Some(contact_id),
            ..Default::default()
        });
        let identifiers = Arc::new(MemoryIdentifiers::default());
        let handler = handler(messages.clone(), identifiers.clone());

        let outcome = handler
            .handle("default", &payload("m1", false), json!({}))
            .await
            .unwrap();

        assert!(matches!(outcome, MessageHandlingOutcome::Recorded(p) if p.contact_id == Some(contact_id)));
        let saved = identifiers.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, contact_id);
        assert!(saved[0].1.contains(&ContactIdentifier::new("whatsapp_phone", "34600111222")));
        assert!(saved[0].1.contains(&ContactIdentifier::new("whatsapp_push_name", "Ana")));
    }

    #[tokio::test]
    async fn test_self_sent_replay_is_stored_once() {
        let messages = Arc::new(MemoryMessages::default());
        let handler = handler(messages.clone(), Arc::new(MemoryIdentifiers::default()));
        let echo = payload("m-echo", true);

        let first = handler.handle("default", &echo, json!({})).await.unwrap();
        let second = handler.handle("default", &echo, json!({})).await.unwrap();

        assert!(matches!(first, MessageHandlingOutcome::Recorded(_)));
        assert_eq!(second, MessageHandlingOutcome::DuplicateEcho);
        assert_eq!(messages.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_self_sent_from_other_device_is_recorded() {
        let messages = Arc::new(MemoryMessages::default());
        let handler = handler(messages.clone(), Arc::new(MemoryIdentifiers::default()));

        let outcome = handler
            .handle("default", &payload("m-other-device", true), json!({}))
            .await
            .unwrap();

        assert!(matches!(outcome, MessageHandlingOutcome::Recorded(_)));
        assert!(messages.stored.lock().unwrap().contains_key("m-other-device"));
    }

    #[tokio::test]
    async fn test_identifier_failure_does_not_fail_message() {
        let messages = Arc::new(MemoryMessages {
            contact_id: Some(Uuid::new_v4()),
            ..Default::default()
        });
        let identifiers = Arc::new(MemoryIdentifiers {
            fail: true,
            ..Default::default()
        });
        let handler = handler(messages, identifiers);

        let outcome = handler.handle("default", &payload("m2", false), json!({})).await;
        assert!(matches!(outcome, Ok(MessageHandlingOutcome::Recorded(_))));
    }

    #[tokio::test]
    async fn test_recorder_failure_propagates() {
        let messages = Arc::new(MemoryMessages {
            fail: true,
            ..Default::default()
        });
        let handler = handler(messages, Arc::new(MemoryIdentifiers::default()));

        let result = handler.handle("default", &payload("m3", false), json!({})).await;
        assert_eq!(result, Err(PortError::Storage("db down".to_string())));
    }
}
