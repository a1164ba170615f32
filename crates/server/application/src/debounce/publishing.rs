//! Hands debounced batches to the broker

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulso_server_domain::debounce::{BatchProcessor, BufferedMessage, DebounceError, SessionKey};
use pulso_server_domain::queue::QueueTransport;
use pulso_shared::queue_names::DEBOUNCED_BATCHES;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A flushed conversation batch as published for enrichment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebouncedBatch {
    pub session_key: String,
    pub contact_id: String,
    pub channel_type: String,
    pub channel_id: String,
    /// Ordered by timestamp
    pub messages: Vec<BufferedMessage>,
    /// Non-empty texts joined by newlines
    pub combined_text: String,
    pub flushed_at: DateTime<Utc>,
}

impl DebouncedBatch {
    pub fn new(key: &SessionKey, messages: Vec<BufferedMessage>) -> Self {
        let combined_text = messages
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            session_key: key.to_string(),
            contact_id: key.contact_id.clone(),
            channel_type: key.channel_type.clone(),
            channel_id: key.channel_id.clone(),
            messages,
            combined_text,
            flushed_at: Utc::now(),
        }
    }
}

/// [`BatchProcessor`] publishing each batch to a queue
pub struct PublishingBatchProcessor {
    transport: Arc<dyn QueueTransport>,
    queue: String,
}

impl PublishingBatchProcessor {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self::with_queue(transport, DEBOUNCED_BATCHES)
    }

    pub fn with_queue(transport: Arc<dyn QueueTransport>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl BatchProcessor for PublishingBatchProcessor {
    async fn process_batch(
        &self,
        key: &SessionKey,
        messages: Vec<BufferedMessage>,
    ) -> Result<(), DebounceError> {
        let batch = DebouncedBatch::new(key, messages);
        let body = serde_json::to_vec(&batch)?;
        self.transport
            .publish(&self.queue, &body)
            .await
            .map_err(|e| DebounceError::Processor(e.to_string()))?;
        debug!(session_key = %key, count = batch.messages.len(), queue = %self.queue, "Debounced batch published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulso_server_domain::queue::{MessageConsumer, TransportError};
    use std::sync::Mutex;
    use tokio::sync::watch;

    #[derive(Default)]
    struct CapturingTransport {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl QueueTransport for CapturingTransport {
        async fn declare_queue(&self, _name: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn declare_queue_with_dlq(&self, _name: &str, _max: u32) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            self.published
                .lock()
                .unwrap()
                .push((queue.to_string(), body.to_vec()));
            Ok(())
        }

        async fn start_consumer(
            &self,
            _queue: &str,
            _tag: &str,
            _consumer: Arc<dyn MessageConsumer>,
            _prefetch: u16,
            _shutdown: watch::Receiver<bool>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_published_to_debounce_queue() {
        let transport = Arc::new(CapturingTransport::default());
        let processor = PublishingBatchProcessor::new(transport.clone());
        let key = SessionKey::new("c1", "whatsapp", "ch1");
        let messages = vec![
            BufferedMessage::text("a", "hola", 1000),
            BufferedMessage::text("b", "  ", 1500),
            BufferedMessage::text("c", "quiero info", 2000),
        ];

        processor.process_batch(&key, messages).await.unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published[0].0, DEBOUNCED_BATCHES);
        let batch: DebouncedBatch = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(batch.session_key, "c1:whatsapp:ch1");
        assert_eq!(batch.messages.len(), 3);
        assert_eq!(batch.combined_text, "hola\nquiero info");
    }

    #[tokio::test]
    async fn test_publish_failure_is_processor_error() {
        let transport = Arc::new(CapturingTransport {
            fail: true,
            ..Default::default()
        });
        let processor = PublishingBatchProcessor::new(transport);

        let result = processor
            .process_batch(&SessionKey::new("c", "t", "i"), vec![BufferedMessage::text("a", "x", 1)])
            .await;
        assert!(matches!(result, Err(DebounceError::Processor(_))));
    }
}
