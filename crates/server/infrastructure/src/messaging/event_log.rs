//! Best-effort log of raw webhook ingestion
//!
//! The Raw Event Bus hands one entry per publish to an [`EventLogWriter`],
//! which queues it for a background task. A full queue drops the entry with
//! a warning; the publish path never waits on the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a raw event left the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLogOutcome {
    Published,
    /// The failure envelope was published in place of the event
    Substituted,
    /// Nothing reached the broker
    Lost,
}

impl EventLogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLogOutcome::Published => "published",
            EventLogOutcome::Substituted => "substituted",
            EventLogOutcome::Lost => "lost",
        }
    }
}

/// One ingestion record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub raw_event_id: Uuid,
    pub session_key: String,
    pub source: String,
    pub queue: String,
    pub body_size: usize,
    pub outcome: EventLogOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("Event log storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Destination of event log entries
#[async_trait]
pub trait EventLogSink: Send + Sync {
    async fn record(&self, entry: &EventLogEntry) -> Result<(), EventLogError>;
}

/// Writes entries as structured `tracing` events
#[derive(Debug, Clone, Default)]
pub struct TracingEventLogSink;

#[async_trait]
impl EventLogSink for TracingEventLogSink {
    async fn record(&self, entry: &EventLogEntry) -> Result<(), EventLogError> {
        info!(
            raw_event_id = %entry.raw_event_id,
            session_key = %entry.session_key,
            source = %entry.source,
            queue = %entry.queue,
            body_size = entry.body_size,
            outcome = entry.outcome.as_str(),
            "Raw event ingested"
        );
        Ok(())
    }
}

/// Appends entries to the `raw_event_log` table
#[derive(Debug, Clone)]
pub struct PostgresEventLogSink {
    pool: PgPool,
}

impl PostgresEventLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_event_log (
                raw_event_id UUID PRIMARY KEY,
                session_key VARCHAR(200) NOT NULL,
                source VARCHAR(100) NOT NULL,
                queue VARCHAR(255) NOT NULL,
                body_size INTEGER NOT NULL,
                outcome VARCHAR(20) NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_event_log_session ON raw_event_log(session_key, recorded_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventLogSink for PostgresEventLogSink {
    async fn record(&self, entry: &EventLogEntry) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            INSERT INTO raw_event_log
                (raw_event_id, session_key, source, queue, body_size, outcome, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (raw_event_id) DO NOTHING
            "#,
        )
        .bind(entry.raw_event_id)
        .bind(&entry.session_key)
        .bind(&entry.source)
        .bind(&entry.queue)
        .bind(i32::try_from(entry.body_size).unwrap_or(i32::MAX))
        .bind(entry.outcome.as_str())
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Bounded background queue in front of an [`EventLogSink`]
#[derive(Debug, Clone)]
pub struct EventLogWriter {
    sender: mpsc::Sender<EventLogEntry>,
    dropped: Arc<AtomicU64>,
}

impl EventLogWriter {
    /// Spawn the background task draining entries into `sink`
    ///
    /// The task ends once every writer clone is dropped.
    pub fn spawn(sink: Arc<dyn EventLogSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<EventLogEntry>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if let Err(e) = sink.record(&entry).await {
                    warn!(raw_event_id = %entry.raw_event_id, error = %e, "Failed to write event log entry");
                }
            }
            debug!("Event log writer stopped");
        });

        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Queue `entry` without waiting
    pub fn record(&self, entry: EventLogEntry) {
        match self.sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(raw_event_id = %entry.raw_event_id, "Event log queue full, dropping entry");
            }
            Err(TrySendError::Closed(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(raw_event_id = %entry.raw_event_id, "Event log writer closed, dropping entry");
            }
        }
    }

    /// Entries dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<EventLogEntry>>,
    }

    #[async_trait]
    impl EventLogSink for RecordingSink {
        async fn record(&self, entry: &EventLogEntry) -> Result<(), EventLogError> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn entry() -> EventLogEntry {
        EventLogEntry {
            raw_event_id: Uuid::new_v4(),
            session_key: "default".to_string(),
            source: "waha".to_string(),
            queue: "webhooks.raw".to_string(),
            body_size: 42,
            outcome: EventLogOutcome::Published,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_entries_reach_sink() {
        let sink = Arc::new(RecordingSink::default());
        let (writer, handle) = EventLogWriter::spawn(sink.clone(), 16);

        let first = entry();
        writer.record(first.clone());
        writer.record(entry());
        drop(writer);
        handle.await.unwrap();

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
    }

    #[tokio::test]
    async fn test_full_queue_drops_entries() {
        let sink = Arc::new(RecordingSink::default());
        let (writer, handle) = EventLogWriter::spawn(sink.clone(), 1);

        // The drain task has not run yet on this single-threaded runtime
        writer.record(entry());
        writer.record(entry());
        writer.record(entry());
        assert_eq!(writer.dropped(), 2);

        drop(writer);
        handle.await.unwrap();
        assert_eq!(sink.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tracing_sink_never_fails() {
        assert!(TracingEventLogSink.record(&entry()).await.is_ok());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(EventLogOutcome::Substituted).unwrap();
        assert_eq!(json, "substituted");
        assert_eq!(EventLogOutcome::Lost.as_str(), "lost");
    }
}
