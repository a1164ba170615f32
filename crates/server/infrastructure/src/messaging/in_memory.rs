//! In-memory queue transport
//!
//! Honors the whole transport contract (tolerant declaration, manual
//! acknowledgement, requeue, dead-letter routing) inside one process. Used by
//! tests and by local runs without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pulso_server_domain::queue::{
    AckDecision, DEFAULT_MAX_RETRIES, Delivery, MessageConsumer, QueueTransport, TransportError,
    dead_letter_headers,
};
use pulso_shared::queue_names::dlq_name;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: HashMap<String, String>,
    deliveries: u32,
}

#[derive(Debug)]
struct MemoryQueue {
    max_retries: Option<u32>,
    messages: VecDeque<StoredMessage>,
    ready: Arc<Notify>,
}

impl MemoryQueue {
    fn new(max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            messages: VecDeque::new(),
            ready: Arc::new(Notify::new()),
        }
    }
}

/// Queue transport keeping every queue in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueTransport {
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
    publish_failure: Arc<Mutex<Option<String>>>,
    channel_reopens: Arc<AtomicU64>,
}

impl InMemoryQueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every publish fail with `message` until cleared with `None`
    pub fn set_publish_failure(&self, message: Option<&str>) {
        *self
            .publish_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message.map(str::to_string);
    }

    /// Times a conflicting declaration forced the channel to be reopened
    pub fn channel_reopens(&self) -> u64 {
        self.channel_reopens.load(Ordering::Relaxed)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.queues().contains_key(queue)
    }

    /// Retry ceiling registered for `queue`, if it was declared with a DLQ
    pub fn max_retries(&self, queue: &str) -> Option<u32> {
        self.queues().get(queue).and_then(|q| q.max_retries)
    }

    /// Messages waiting in `queue`, oldest first
    pub fn pending(&self, queue: &str) -> Vec<Delivery> {
        self.queues()
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|m| Delivery {
                        queue: queue.to_string(),
                        body: m.body.clone(),
                        headers: m.headers.clone(),
                        prior_attempts: m.deliveries,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.messages.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    fn declare(&self, name: &str, max_retries: Option<u32>) {
        let mut queues = self.queues();
        match queues.get(name) {
            None => {
                queues.insert(name.to_string(), MemoryQueue::new(max_retries));
                debug!(queue = name, "Queue declared");
            }
            Some(existing) if existing.max_retries == max_retries => {}
            Some(existing) => {
                warn!(
                    queue = name,
                    existing = ?existing.max_retries,
                    requested = ?max_retries,
                    "Queue already exists with different arguments, keeping existing declaration"
                );
                self.channel_reopens.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn enqueue(&self, queue: &str, message: StoredMessage) -> Result<(), TransportError> {
        let mut queues = self.queues();
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Publish {
                queue: queue.to_string(),
                message: "queue not declared".to_string(),
            })?;
        target.messages.push_back(message);
        target.ready.notify_one();
        Ok(())
    }

    /// Deliver the oldest message of `queue` to `consumer` and settle it
    ///
    /// Returns `None` when the queue is empty.
    pub async fn process_next(
        &self,
        queue: &str,
        consumer: &dyn MessageConsumer,
    ) -> Result<Option<AckDecision>, TransportError> {
        let (message, max_retries) = {
            let mut queues = self.queues();
            let source = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::Consume {
                    queue: queue.to_string(),
                    message: "queue not declared".to_string(),
                })?;
            match source.messages.pop_front() {
                Some(message) => (message, source.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)),
                None => return Ok(None),
            }
        };

        let delivery = Delivery {
            queue: queue.to_string(),
            body: message.body.clone(),
            headers: message.headers.clone(),
            prior_attempts: message.deliveries,
        };
        let outcome = consumer.process(&delivery).await;
        let decision = AckDecision::evaluate(&outcome, message.deliveries, max_retries);

        match decision {
            AckDecision::Ack => {}
            AckDecision::Requeue => {
                let mut redelivery = message;
                redelivery.deliveries += 1;
                self.enqueue(queue, redelivery)?;
            }
            AckDecision::DeadLetter => {
                let dlq = dlq_name(queue);
                if !self.is_declared(&dlq) {
                    // Keep the delivery where it was, as a failed DLQ publish would
                    let mut redelivery = message;
                    redelivery.deliveries += 1;
                    self.enqueue(queue, redelivery)?;
                    return Err(TransportError::Publish {
                        queue: dlq,
                        message: "dead-letter queue not declared".to_string(),
                    });
                }
                let reason = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                let mut dead = message;
                for (name, value) in dead_letter_headers(queue, dead.deliveries, &reason) {
                    dead.headers.insert(name.to_string(), value);
                }
                dead.deliveries = 0;
                self.enqueue(&dlq, dead)?;
            }
        }

        Ok(Some(decision))
    }

    fn ready_signal(&self, queue: &str) -> Option<Arc<Notify>> {
        self.queues().get(queue).map(|q| q.ready.clone())
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        self.declare(name, None);
        Ok(())
    }

    async fn declare_queue_with_dlq(
        &self,
        name: &str,
        max_retries: u32,
    ) -> Result<(), TransportError> {
        self.declare(&dlq_name(name), None);
        self.declare(name, Some(max_retries));
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let failure = self
            .publish_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = failure {
            return Err(TransportError::Publish {
                queue: queue.to_string(),
                message,
            });
        }

        self.enqueue(
            queue,
            StoredMessage {
                body: body.to_vec(),
                headers: HashMap::new(),
                deliveries: 0,
            },
        )
    }

    async fn start_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn MessageConsumer>,
        prefetch: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let ready = self
            .ready_signal(queue)
            .ok_or_else(|| TransportError::Consume {
                queue: queue.to_string(),
                message: "queue not declared".to_string(),
            })?;
        info!(queue, tag, prefetch, "Consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.process_next(queue, consumer.as_ref()).await?.is_some() {
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ready.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }

        info!(queue, tag, "Consumer stopped");
        Ok(())
    }
}
