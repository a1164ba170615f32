//! In-memory outbox store
//!
//! Mirrors the Postgres store: events are staged in an [`InMemoryOutboxTx`]
//! and become visible, and are announced on the notification channel, only
//! when the transaction commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulso_server_domain::outbox::{
    OutboxAppender, OutboxError, OutboxEvent, OutboxNotificationSource, OutboxNotifications,
    OutboxRepository, OutboxStats, OutboxStatus,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredEvent {
    event: OutboxEvent,
    /// Insertion order, used as a stable tie-breaker
    sequence: u64,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct OutboxState {
    events: HashMap<Uuid, StoredEvent>,
    next_sequence: u64,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
}

/// Transactional context of the in-memory store
#[derive(Debug, Default)]
pub struct InMemoryOutboxTx {
    staged: Vec<OutboxEvent>,
}

impl InMemoryOutboxTx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staged(&self) -> &[OutboxEvent] {
        &self.staged
    }
}

/// In-memory implementation of the outbox ports
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxRepository {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self) -> InMemoryOutboxTx {
        InMemoryOutboxTx::new()
    }

    /// Make the staged events visible and notify subscribers with their ids
    pub fn commit(&self, tx: InMemoryOutboxTx) {
        let mut state = self.state();
        let mut ids = Vec::with_capacity(tx.staged.len());
        for mut event in tx.staged {
            event.status = OutboxStatus::Pending;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            ids.push(event.event_id);
            state.events.insert(
                event.event_id,
                StoredEvent {
                    event,
                    sequence,
                    claimed_at: None,
                },
            );
        }
        state
            .subscribers
            .retain(|subscriber| ids.iter().all(|id| subscriber.send(id.to_string()).is_ok()));
    }

    /// Discard the staged events
    pub fn rollback(&self, tx: InMemoryOutboxTx) {
        drop(tx);
    }

    /// Subscribe to commit notifications
    pub fn notifications(&self) -> InMemoryNotifications {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state().subscribers.push(sender);
        InMemoryNotifications { receiver }
    }

    /// End every open subscription, as a dropped database connection would
    pub fn close_notifications(&self) {
        self.state().subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backdate a claim, to exercise stale-claim recovery
    pub fn set_claimed_at(&self, id: Uuid, claimed_at: DateTime<Utc>) {
        if let Some(stored) = self.state().events.get_mut(&id) {
            stored.claimed_at = Some(claimed_at);
        }
    }

    /// Backdate processing, to exercise cleanup
    pub fn set_processed_at(&self, id: Uuid, processed_at: DateTime<Utc>) {
        if let Some(stored) = self.state().events.get_mut(&id) {
            stored.event.processed_at = Some(processed_at);
        }
    }

    /// Apply `f` to an event this dispatcher still has claimed
    fn settle<F>(&self, id: Uuid, f: F) -> Result<(), OutboxError>
    where
        F: FnOnce(&mut StoredEvent),
    {
        let mut state = self.state();
        match state.events.get_mut(&id) {
            Some(stored) if stored.event.status == OutboxStatus::Processing => {
                f(stored);
                Ok(())
            }
            _ => Err(OutboxError::InvalidStatus(format!(
                "event {id} is not claimed for processing"
            ))),
        }
    }
}

fn age_cutoff(older_than: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl OutboxAppender<InMemoryOutboxTx> for InMemoryOutboxRepository {
    async fn append(&self, tx: &mut InMemoryOutboxTx, event: &OutboxEvent) -> Result<(), OutboxError> {
        tx.staged.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        Ok(self.state().events.get(&id).map(|s| s.event.clone()))
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let state = self.state();
        let mut pending: Vec<&StoredEvent> = state
            .events
            .values()
            .filter(|s| s.event.is_pending())
            .collect();
        pending.sort_by_key(|s| (s.event.created_at, s.sequence));
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|s| s.event.clone())
            .collect())
    }

    async fn mark_as_processing(&self, id: Uuid) -> Result<bool, OutboxError> {
        let mut state = self.state();
        match state.events.get_mut(&id) {
            Some(stored) if stored.event.is_pending() => {
                stored.event.status = OutboxStatus::Processing;
                stored.claimed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_as_processed(&self, id: Uuid) -> Result<(), OutboxError> {
        self.settle(id, |stored| {
            stored.event.status = OutboxStatus::Processed;
            stored.event.processed_at = Some(Utc::now());
            stored.event.last_error = None;
        })
    }

    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), OutboxError> {
        self.settle(id, |stored| {
            stored.event.status = OutboxStatus::Failed;
            stored.event.retry_count += 1;
            stored.event.last_error = Some(error.to_string());
        })
    }

    async fn reset_failed(&self, id: Uuid) -> Result<bool, OutboxError> {
        let mut state = self.state();
        match state.events.get_mut(&id) {
            Some(stored) if stored.event.has_failed() => {
                stored.event.status = OutboxStatus::Pending;
                stored.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale_processing(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let cutoff = age_cutoff(older_than);
        let mut state = self.state();
        let mut released = 0;
        for stored in state.events.values_mut() {
            let stale = stored.event.status == OutboxStatus::Processing
                && stored.claimed_at.is_some_and(|at| at < cutoff);
            if stale {
                stored.event.status = OutboxStatus::Pending;
                stored.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get_stats(&self) -> Result<OutboxStats, OutboxError> {
        let state = self.state();
        let mut stats = OutboxStats::default();
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for stored in state.events.values() {
            match stored.event.status {
                OutboxStatus::Pending => {
                    stats.pending_count += 1;
                    let created = stored.event.created_at;
                    oldest_pending = Some(oldest_pending.map_or(created, |o| o.min(created)));
                }
                OutboxStatus::Processing => stats.processing_count += 1,
                OutboxStatus::Processed => stats.processed_count += 1,
                OutboxStatus::Failed => stats.failed_count += 1,
            }
        }

        stats.oldest_pending_age_seconds =
            oldest_pending.map(|created| (Utc::now() - created).num_seconds());
        Ok(stats)
    }

    async fn cleanup_processed(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let cutoff = age_cutoff(older_than);
        let mut state = self.state();
        let before = state.events.len();
        state.events.retain(|_, stored| {
            !(stored.event.is_processed()
                && stored.event.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.events.len()) as u64)
    }
}

/// Commit notifications of an [`InMemoryOutboxRepository`]
#[derive(Debug)]
pub struct InMemoryNotifications {
    receiver: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl OutboxNotifications for InMemoryNotifications {
    async fn next_notification(&mut self) -> Result<Option<String>, OutboxError> {
        Ok(self.receiver.recv().await)
    }
}

#[async_trait]
impl OutboxNotificationSource for InMemoryOutboxRepository {
    async fn subscribe(&self) -> Result<Box<dyn OutboxNotifications>, OutboxError> {
        Ok(Box::new(self.notifications()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str) -> OutboxEvent {
        OutboxEvent::pending(Uuid::new_v4(), "message", event_type, json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_events_visible_only_after_commit() {
        let repo = InMemoryOutboxRepository::new();
        let mut tx = repo.begin();
        repo.append(&mut tx, &event("message.received")).await.unwrap();

        assert!(repo.get_pending(10).await.unwrap().is_empty());
        repo.commit(tx);
        assert_eq!(repo.get_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_events() {
        let repo = InMemoryOutboxRepository::new();
        let mut tx = repo.begin();
        repo.append(&mut tx, &event("message.received")).await.unwrap();
        repo.rollback(tx);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_commit_notifies_with_event_id() {
        let repo = InMemoryOutboxRepository::new();
        let mut notifications = repo.notifications();
        let record = event("message.received");

        let mut tx = repo.begin();
        repo.append(&mut tx, &record).await.unwrap();
        repo.commit(tx);

        let payload = notifications.next_notification().await.unwrap();
        assert_eq!(payload, Some(record.event_id.to_string()));
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let repo = InMemoryOutboxRepository::new();
        let record = event("message.received");
        let mut tx = repo.begin();
        repo.append(&mut tx, &record).await.unwrap();
        repo.commit(tx);

        assert!(repo.mark_as_processing(record.event_id).await.unwrap());
        assert!(!repo.mark_as_processing(record.event_id).await.unwrap());
        assert!(!repo.mark_as_processing(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_event_reset_and_stats() {
        let repo = InMemoryOutboxRepository::new();
        let failed = event("a");
        let done = event("b");
        let mut tx = repo.begin();
        repo.append(&mut tx, &failed).await.unwrap();
        repo.append(&mut tx, &done).await.unwrap();
        repo.commit(tx);

        repo.mark_as_processing(failed.event_id).await.unwrap();
        repo.mark_as_failed(failed.event_id, "broker down").await.unwrap();
        repo.mark_as_processing(done.event_id).await.unwrap();
        repo.mark_as_processed(done.event_id).await.unwrap();

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.processed_count, 1);
        assert_eq!(stats.pending_count, 0);

        let stored = repo.find_by_id(failed.event_id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));

        assert!(repo.reset_failed(failed.event_id).await.unwrap());
        assert!(!repo.reset_failed(done.event_id).await.unwrap());
        assert_eq!(repo.get_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_stale_processing() {
        let repo = InMemoryOutboxRepository::new();
        let stale = event("a");
        let fresh = event("b");
        let mut tx = repo.begin();
        repo.append(&mut tx, &stale).await.unwrap();
        repo.append(&mut tx, &fresh).await.unwrap();
        repo.commit(tx);
        repo.mark_as_processing(stale.event_id).await.unwrap();
        repo.mark_as_processing(fresh.event_id).await.unwrap();
        repo.set_claimed_at(stale.event_id, Utc::now() - chrono::Duration::minutes(10));

        let released = repo
            .release_stale_processing(Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(released, 1);
        let pending = repo.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, stale.event_id);
    }

    #[tokio::test]
    async fn test_late_settle_does_not_overwrite_reclaimed_event() {
        let repo = InMemoryOutboxRepository::new();
        let record = event("message.received");
        let mut tx = repo.begin();
        repo.append(&mut tx, &record).await.unwrap();
        repo.commit(tx);

        assert!(repo.mark_as_processing(record.event_id).await.unwrap());
        repo.set_claimed_at(record.event_id, Utc::now() - chrono::Duration::minutes(10));
        assert_eq!(repo.release_stale_processing(Duration::from_secs(60)).await.unwrap(), 1);

        // The first dispatcher reports after its claim was released
        let late = repo.mark_as_failed(record.event_id, "timeout").await;
        assert!(matches!(late, Err(OutboxError::InvalidStatus(_))));
        let stored = repo.find_by_id(record.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        assert!(repo.mark_as_processing(record.event_id).await.unwrap());
        repo.mark_as_processed(record.event_id).await.unwrap();
        let late = repo.mark_as_failed(record.event_id, "timeout").await;
        assert!(matches!(late, Err(OutboxError::InvalidStatus(_))));
        assert!(repo.find_by_id(record.event_id).await.unwrap().unwrap().is_processed());
    }

    #[tokio::test]
    async fn test_cleanup_processed() {
        let repo = InMemoryOutboxRepository::new();
        let old = event("a");
        let recent = event("b");
        let mut tx = repo.begin();
        repo.append(&mut tx, &old).await.unwrap();
        repo.append(&mut tx, &recent).await.unwrap();
        repo.commit(tx);
        for id in [old.event_id, recent.event_id] {
            repo.mark_as_processing(id).await.unwrap();
            repo.mark_as_processed(id).await.unwrap();
        }
        repo.set_processed_at(old.event_id, Utc::now() - chrono::Duration::days(8));

        let removed = repo
            .cleanup_processed(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(repo.find_by_id(old.event_id).await.unwrap().is_none());
        assert!(repo.find_by_id(recent.event_id).await.unwrap().is_some());
    }
}
