//! OutboxDispatcher - push + fallback outbox relay
//!
//! Committed outbox events reach the queue transport through two triggers
//! sharing one pipeline:
//!
//! ```text
//!   NOTIFY <event id> ──┐
//!                       ├──▶ claim (pending → processing) ──▶ publish ──▶ processed
//!   fallback tick ──────┘          │ lost claim: skip           │ error: failed
//! ```
//!
//! The claim is a single conditional update, so a notification and a
//! concurrent fallback scan never both publish the same event. A
//! subscription that ends or fails is reopened with exponential backoff;
//! fallback scans carry dispatch in the meantime.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pulso_server_domain::outbox::{
    OutboxError, OutboxEvent, OutboxNotificationSource, OutboxNotifications, OutboxRepository,
};
use pulso_server_domain::queue::QueueTransport;
use pulso_shared::config::OutboxConfig;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct OutboxDispatcherConfig {
    /// Maximum events fetched per fallback scan
    pub batch_size: usize,
    /// Interval between fallback scans
    pub poll_interval: Duration,
    /// Claims older than this are returned to pending on each scan
    pub stale_processing_after: Duration,
    /// First delay before reopening a lost notification subscription
    pub resubscribe_backoff: Duration,
}

/// Ceiling for the resubscribe backoff
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(60);

impl Default for OutboxDispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            stale_processing_after: Duration::from_secs(300),
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&OutboxConfig> for OutboxDispatcherConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            stale_processing_after: config.stale_processing_after(),
            ..Self::default()
        }
    }
}

/// What woke the dispatcher for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTrigger {
    Push,
    Fallback,
}

/// Result of dispatching one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published and marked processed
    Dispatched,
    /// Another dispatch path claimed it first, or it is no longer pending
    Skipped,
    /// Publish failed; the event is marked failed
    Failed(String),
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct OutboxDispatcherMetrics {
    push_dispatched: AtomicU64,
    fallback_dispatched: AtomicU64,
    lost_claims: AtomicU64,
    publish_failures: AtomicU64,
}

impl OutboxDispatcherMetrics {
    pub fn push_dispatched(&self) -> u64 {
        self.push_dispatched.load(Ordering::Relaxed)
    }

    pub fn fallback_dispatched(&self) -> u64 {
        self.fallback_dispatched.load(Ordering::Relaxed)
    }

    /// Claims lost to a concurrent dispatch of the same event
    pub fn lost_claims(&self) -> u64 {
        self.lost_claims.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    fn record_dispatched(&self, trigger: DispatchTrigger) {
        match trigger {
            DispatchTrigger::Push => self.push_dispatched.fetch_add(1, Ordering::Relaxed),
            DispatchTrigger::Fallback => self.fallback_dispatched.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Forwards committed outbox events to the queue transport
pub struct OutboxDispatcher {
    repository: Arc<dyn OutboxRepository>,
    transport: Arc<dyn QueueTransport>,
    config: OutboxDispatcherConfig,
    metrics: Arc<OutboxDispatcherMetrics>,
    /// Dispatch queues already declared on this transport
    declared: Mutex<HashSet<String>>,
}

impl OutboxDispatcher {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        transport: Arc<dyn QueueTransport>,
        config: OutboxDispatcherConfig,
    ) -> Self {
        Self {
            repository,
            transport,
            config,
            metrics: Arc::new(OutboxDispatcherMetrics::default()),
            declared: Mutex::new(HashSet::new()),
        }
    }

    pub fn metrics(&self) -> Arc<OutboxDispatcherMetrics> {
        self.metrics.clone()
    }

    /// Run until `shutdown` flips to `true`
    ///
    /// Without a notification `source` only the fallback scan drives
    /// dispatch. A lost subscription is reopened with backoff, followed by a
    /// scan for events committed while nobody was listening.
    pub async fn run(
        &self,
        source: Option<Arc<dyn OutboxNotificationSource>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            push = source.is_some(),
            "Starting outbox dispatcher"
        );

        let mut notifications: Option<Box<dyn OutboxNotifications>> = None;
        let mut backoff = self.config.resubscribe_backoff;
        let mut resubscribe_at = source.as_ref().map(|_| Instant::now());

        // Events committed while no listener was running
        self.process_pending_batch(DispatchTrigger::Fallback).await;

        let mut ticker = interval(self.config.poll_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                notification = next_notification(&mut notifications) => {
                    match notification {
                        Ok(Some(payload)) => {
                            self.dispatch_by_id(&payload, DispatchTrigger::Push).await;
                            continue;
                        }
                        Ok(None) => {
                            warn!(retry_in_ms = backoff.as_millis() as u64, "Outbox notification stream ended, falling back to scans");
                        }
                        Err(e) => {
                            warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Outbox notification listener failed, falling back to scans");
                        }
                    }
                    notifications = None;
                    resubscribe_at = Some(Instant::now() + backoff);
                }
                _ = resubscribe_due(resubscribe_at) => {
                    let Some(source) = source.as_ref() else {
                        resubscribe_at = None;
                        continue;
                    };
                    match source.subscribe().await {
                        Ok(subscription) => {
                            debug!("Outbox notification subscription open");
                            notifications = Some(subscription);
                            resubscribe_at = None;
                            backoff = self.config.resubscribe_backoff;
                            self.process_pending_batch(DispatchTrigger::Fallback).await;
                        }
                        Err(e) => {
                            backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
                            warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Outbox notification subscribe failed");
                            resubscribe_at = Some(Instant::now() + backoff);
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.fallback_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Outbox dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One fallback round: release abandoned claims, then scan pending events
    ///
    /// Returns the number of events dispatched.
    pub async fn fallback_tick(&self) -> usize {
        match self
            .repository
            .release_stale_processing(self.config.stale_processing_after)
            .await
        {
            Ok(0) => {}
            Ok(released) => warn!(released, "Released stale outbox claims"),
            Err(e) => error!(error = %e, "Failed to release stale outbox claims"),
        }
        self.process_pending_batch(DispatchTrigger::Fallback).await
    }

    /// Dispatch a bounded batch of pending events in creation order
    pub async fn process_pending_batch(&self, trigger: DispatchTrigger) -> usize {
        let events = match self.repository.get_pending(self.config.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to fetch pending outbox events");
                return 0;
            }
        };
        if events.is_empty() {
            return 0;
        }

        debug!(count = events.len(), "Processing pending outbox batch");
        let mut dispatched = 0;
        for event in events {
            if self.dispatch_event(&event, trigger).await == DispatchOutcome::Dispatched {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Dispatch the event named by a notification payload
    pub async fn dispatch_by_id(&self, payload: &str, trigger: DispatchTrigger) -> DispatchOutcome {
        let id = match Uuid::parse_str(payload.trim()) {
            Ok(id) => id,
            Err(_) => {
                warn!(payload, "Ignoring outbox notification with an invalid event id");
                return DispatchOutcome::Skipped;
            }
        };

        match self.repository.find_by_id(id).await {
            Ok(Some(event)) if event.is_pending() => self.dispatch_event(&event, trigger).await,
            Ok(Some(event)) => {
                debug!(event_id = %id, status = event.status.as_str(), "Outbox event no longer pending");
                DispatchOutcome::Skipped
            }
            Ok(None) => {
                debug!(event_id = %id, "Notified outbox event not found");
                DispatchOutcome::Skipped
            }
            Err(e) => {
                error!(event_id = %id, error = %e, "Failed to load notified outbox event");
                DispatchOutcome::Skipped
            }
        }
    }

    /// Claim, publish and settle one event
    pub async fn dispatch_event(&self, event: &OutboxEvent, trigger: DispatchTrigger) -> DispatchOutcome {
        let id = event.event_id;
        match self.repository.mark_as_processing(id).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.lost_claims.fetch_add(1, Ordering::Relaxed);
                debug!(event_id = %id, ?trigger, "Outbox event claimed elsewhere");
                return DispatchOutcome::Skipped;
            }
            Err(e) => {
                error!(event_id = %id, error = %e, "Failed to claim outbox event");
                return DispatchOutcome::Skipped;
            }
        }

        match self.publish(event).await {
            Ok(()) => {
                if let Err(e) = self.repository.mark_as_processed(id).await {
                    // Published but still `processing`: the stale-claim release
                    // will dispatch it again, which consumers tolerate.
                    error!(event_id = %id, error = %e, "Failed to mark outbox event processed");
                }
                self.metrics.record_dispatched(trigger);
                debug!(
                    event_id = %id,
                    event_type = %event.event_type,
                    ?trigger,
                    "Outbox event dispatched"
                );
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                let reason = e.to_string();
                self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %id, error = %reason, "Outbox event publish failed");
                if let Err(mark_error) = self.repository.mark_as_failed(id, &reason).await {
                    error!(event_id = %id, error = %mark_error, "Failed to mark outbox event failed");
                }
                DispatchOutcome::Failed(reason)
            }
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<(), OutboxError> {
        let queue = event.queue_name();
        self.ensure_declared(&queue).await?;
        let body = event.payload_bytes()?;
        self.transport
            .publish(&queue, &body)
            .await
            .map_err(|e| OutboxError::Publish(e.to_string()))
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), OutboxError> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }
        self.transport
            .declare_queue(queue)
            .await
            .map_err(|e| OutboxError::Publish(e.to_string()))?;
        declared.insert(queue.to_string());
        Ok(())
    }
}

async fn resubscribe_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

async fn next_notification(
    notifications: &mut Option<Box<dyn OutboxNotifications>>,
) -> Result<Option<String>, OutboxError> {
    match notifications {
        Some(listener) => listener.next_notification().await,
        None => futures::future::pending().await,
    }
}
