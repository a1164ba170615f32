//! Circuit breaker decorator for a queue transport
//!
//! Publish and declaration calls go through a shared breaker. Consumer loops
//! are long-lived and recover through reconnection, so they bypass it.

use std::sync::Arc;

use async_trait::async_trait;
use pulso_server_domain::queue::{MessageConsumer, QueueSpec, QueueTransport, TransportError};
use pulso_server_domain::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats,
};
use tokio::sync::watch;

/// Wraps a transport with a circuit breaker
pub struct CircuitBreakerTransport<T: QueueTransport> {
    inner: T,
    breaker: CircuitBreaker,
}

impl<T: QueueTransport> CircuitBreakerTransport<T> {
    pub fn new(inner: T, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("queue-transport", config),
        }
    }

    pub fn with_default_config(inner: T) -> Self {
        Self::new(inner, CircuitBreakerConfig::default())
    }

    /// Breaker state and counters for health reporting
    pub fn stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    fn map_error(&self, error: CircuitBreakerError<TransportError>) -> TransportError {
        match error {
            CircuitBreakerError::Open => {
                TransportError::CircuitOpen(self.breaker.name().to_string())
            }
            CircuitBreakerError::Timeout => TransportError::Timeout(format!(
                "{} call exceeded its deadline",
                self.breaker.name()
            )),
            CircuitBreakerError::Failed(e) => e,
        }
    }
}

#[async_trait]
impl<T: QueueTransport> QueueTransport for CircuitBreakerTransport<T> {
    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        self.breaker
            .execute(self.inner.declare_queue(name))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn declare_queue_with_dlq(
        &self,
        name: &str,
        max_retries: u32,
    ) -> Result<(), TransportError> {
        self.breaker
            .execute(self.inner.declare_queue_with_dlq(name, max_retries))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        self.breaker
            .execute(self.inner.publish(queue, body))
            .await
            .map_err(|e| self.map_error(e))
    }

    /// One breaker call for the whole topology
    async fn setup_all_queues(&self, topology: &[QueueSpec]) -> Result<(), TransportError> {
        self.breaker
            .execute(self.inner.setup_all_queues(topology))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn start_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn MessageConsumer>,
        prefetch: u16,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        self.inner
            .start_consumer(queue, tag, consumer, prefetch, shutdown)
            .await
    }
}
