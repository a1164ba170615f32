//! Queue Transport port
//!
//! Broker-agnostic contract for durable queues: idempotent declaration,
//! at-least-once publish and manually acknowledged consumer loops.
//!
//! Consumers only report success or a typed failure; acknowledgement,
//! requeue and dead-letter bookkeeping belong to the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::topology::QueueSpec;

/// Errors raised by a queue transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Queue declaration failed for {queue}: {message}")]
    Declare { queue: String, message: String },

    #[error("Publish to {queue} failed: {message}")]
    Publish { queue: String, message: String },

    #[error("Consumer error on {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Typed failure returned by a [`MessageConsumer`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    /// The delivery could not be decoded or validated
    #[error("Parse error: {0}")]
    Parse(String),

    /// A valid delivery failed downstream handling
    #[error("Processing error: {0}")]
    Processing(String),

    /// Processing panicked; the panic was contained
    #[error("Consumer panicked: {0}")]
    Panic(String),
}

/// A message handed to a consumer
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    /// Queue the message was consumed from
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Deliveries of this message before the current one
    pub prior_attempts: u32,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            body,
            headers: HashMap::new(),
            prior_attempts: 0,
        }
    }

    pub fn with_prior_attempts(mut self, prior_attempts: u32) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }
}

/// Processes one delivery and reports the outcome
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), ConsumerError>;
}

/// Durable queue transport
///
/// Implementations must keep declarations idempotent: a queue that already
/// exists with incompatible arguments is logged and accepted, never an error.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Declare a durable queue without dead-letter routing
    async fn declare_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Declare a durable queue, its `<name>.dlq` companion and a delivery ceiling
    ///
    /// # Arguments
    ///
    /// * `name` - Primary queue name
    /// * `max_retries` - Prior delivery attempts after which a failing message is dead-lettered
    async fn declare_queue_with_dlq(
        &self,
        name: &str,
        max_retries: u32,
    ) -> Result<(), TransportError>;

    /// Persistent, at-least-once publish. Failures are always returned.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Declare every queue of a topology, in order
    async fn setup_all_queues(&self, topology: &[QueueSpec]) -> Result<(), TransportError> {
        for spec in topology {
            match spec.max_retries {
                Some(max_retries) => self.declare_queue_with_dlq(&spec.name, max_retries).await?,
                None => self.declare_queue(&spec.name).await?,
            }
        }
        Ok(())
    }

    /// Run a consumer loop on `queue` until `shutdown` flips to `true`
    ///
    /// At most `prefetch` deliveries are unacknowledged at any time. Each
    /// delivery is acknowledged, requeued or dead-lettered according to
    /// [`AckDecision::evaluate`](super::AckDecision::evaluate).
    async fn start_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn MessageConsumer>,
        prefetch: u16,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        declared: Mutex<Vec<(String, Option<u32>)>>,
    }

    #[async_trait]
    impl QueueTransport for RecordingTransport {
        async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
            self.declared.lock().unwrap().push((name.to_string(), None));
            Ok(())
        }

        async fn declare_queue_with_dlq(
            &self,
            name: &str,
            max_retries: u32,
        ) -> Result<(), TransportError> {
            self.declared
                .lock()
                .unwrap()
                .push((name.to_string(), Some(max_retries)));
            Ok(())
        }

        async fn publish(&self, _queue: &str, _body: &[u8]) -> Result<(), TransportError> {
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
    async fn test_setup_all_queues_declares_in_order() {
        let transport = RecordingTransport::default();
        let topology = vec![QueueSpec::with_dlq("a", 3), QueueSpec::plain("b")];

        transport.setup_all_queues(&topology).await.unwrap();

        let declared = transport.declared.lock().unwrap().clone();
        assert_eq!(
            declared,
            vec![("a".to_string(), Some(3)), ("b".to_string(), None)]
        );
    }

    #[test]
    fn test_delivery_builder() {
        let delivery = Delivery::new("q", b"{}".to_vec()).with_prior_attempts(2);
        assert_eq!(delivery.queue, "q");
        assert_eq!(delivery.prior_attempts, 2);
    }
}
