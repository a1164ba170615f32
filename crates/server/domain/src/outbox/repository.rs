//! Outbox Repository ports
//!
//! Persistence contracts for the Transactional Outbox Pattern. Writing an
//! event happens through [`OutboxAppender`] inside the caller's transaction;
//! everything the dispatcher does afterwards goes through [`OutboxRepository`].

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::model::{OutboxError, OutboxEvent};

/// Writes outbox events through a caller-owned transaction
///
/// `Tx` is the transactional context the aggregate itself is persisted
/// with. The appender never opens or commits a transaction.
#[async_trait]
pub trait OutboxAppender<Tx: ?Sized + Send>: Send + Sync {
    /// Append a pending event within `tx`
    ///
    /// The event becomes visible to dispatchers only when `tx` commits.
    async fn append(&self, tx: &mut Tx, event: &OutboxEvent) -> Result<(), OutboxError>;
}

/// Repository for dispatching outbox events
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Find an event by id
    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError>;

    /// Get pending events in creation order
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum number of events to return
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Claim a pending event
    ///
    /// Must be a single conditional update (`pending -> processing`) so that
    /// two concurrent claimers can never both succeed.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if this caller won the claim, `Ok(false)` if the event was
    /// not pending anymore
    async fn mark_as_processing(&self, id: Uuid) -> Result<bool, OutboxError>;

    /// Mark a claimed event as published
    async fn mark_as_processed(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Mark a claimed event as failed, recording the error and bumping the retry count
    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), OutboxError>;

    /// Return a failed event to pending (operator action)
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the event was failed and is now pending
    async fn reset_failed(&self, id: Uuid) -> Result<bool, OutboxError>;

    /// Return claims older than `older_than` to pending
    ///
    /// Recovers events whose dispatcher died between claim and publish.
    async fn release_stale_processing(&self, older_than: Duration) -> Result<u64, OutboxError>;

    /// Get counts per status
    async fn get_stats(&self) -> Result<OutboxStats, OutboxError>;

    /// Delete processed events older than `older_than`
    async fn cleanup_processed(&self, older_than: Duration) -> Result<u64, OutboxError>;
}

/// Source of "event committed" notifications carrying the event id
#[async_trait]
pub trait OutboxNotifications: Send {
    /// Wait for the next notification payload
    ///
    /// # Returns
    ///
    /// `Ok(Some(payload))` for a notification, `Ok(None)` once the source is closed
    async fn next_notification(&mut self) -> Result<Option<String>, OutboxError>;
}

/// Opens notification subscriptions, again after one ends
#[async_trait]
pub trait OutboxNotificationSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn OutboxNotifications>, OutboxError>;
}

/// Statistics about the outbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending_count: u64,
    pub processing_count: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    pub oldest_pending_age_seconds: Option<i64>,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending_count + self.processing_count + self.processed_count + self.failed_count
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    /// Failed share of finished events (0.0-1.0)
    pub fn failure_rate(&self) -> f64 {
        let finished = self.processed_count + self.failed_count;
        if finished == 0 {
            0.0
        } else {
            self.failed_count as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_stats() {
        let stats = OutboxStats {
            pending_count: 2,
            processing_count: 1,
            processed_count: 6,
            failed_count: 2,
            oldest_pending_age_seconds: Some(12),
        };

        assert_eq!(stats.total(), 11);
        assert!(stats.has_pending());
        assert!((stats.failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats() {
        let stats = OutboxStats::default();
        assert_eq!(stats.total(), 0);
        assert!(!stats.has_pending());
        assert_eq!(stats.failure_rate(), 0.0);
    }
}
