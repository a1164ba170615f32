//! PostgreSQL Outbox Repository
//!
//! SQLx-based outbox store. Inserts go through the caller's transaction; an
//! `AFTER INSERT` trigger emits `pg_notify(<channel>, id)`, which Postgres
//! delivers only once that transaction commits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulso_server_domain::outbox::{
    OutboxAppender, OutboxError, OutboxEvent, OutboxRepository, OutboxStats, OutboxStatus,
};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::FromRow;
use tracing::{debug, info};
use uuid::Uuid;

/// Default channel the insert trigger notifies on
pub const DEFAULT_NOTIFY_CHANNEL: &str = "outbox_events";

const SELECT_COLUMNS: &str = r#"
    SELECT id, aggregate_id, aggregate_type, event_type, event_version,
           payload, metadata, tenant_id, created_at, status, retry_count,
           last_error, processed_at
    FROM outbox_events
"#;

#[derive(FromRow)]
struct OutboxEventRow {
    id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    event_type: String,
    event_version: i32,
    payload: sqlx::types::Json<serde_json::Value>,
    metadata: Option<sqlx::types::Json<serde_json::Value>>,
    tenant_id: Option<String>,
    created_at: DateTime<Utc>,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            event_id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            event_version: row.event_version,
            payload: row.payload.0,
            metadata: row.metadata.map(|m| m.0),
            tenant_id: row.tenant_id,
            created_at: row.created_at,
            status: row.status.parse::<OutboxStatus>()?,
            retry_count: row.retry_count,
            last_error: row.last_error,
            processed_at: row.processed_at,
        })
    }
}

/// PostgreSQL implementation of the outbox ports
#[derive(Debug, Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the outbox table, its pending index and the notify trigger
    ///
    /// # Arguments
    /// * `channel` - Notification channel; letters, digits and `_` only
    pub async fn run_migrations(&self, channel: &str) -> Result<(), OutboxError> {
        validate_channel(channel)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id UUID PRIMARY KEY,
                aggregate_id UUID NOT NULL,
                aggregate_type VARCHAR(100) NOT NULL,
                event_type VARCHAR(200) NOT NULL,
                event_version INTEGER NOT NULL DEFAULT 1,
                payload JSONB NOT NULL,
                metadata JSONB,
                tenant_id VARCHAR(100),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                status VARCHAR(20) NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'processed', 'failed')),
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at TIMESTAMPTZ,
                processed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
            ON outbox_events(created_at)
            WHERE status = 'pending'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&notify_function_sql(channel))
            .execute(&self.pool)
            .await?;

        sqlx::query("DROP TRIGGER IF EXISTS outbox_events_notify ON outbox_events")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER outbox_events_notify
            AFTER INSERT ON outbox_events
            FOR EACH ROW EXECUTE FUNCTION notify_outbox_event()
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(channel, "Outbox migrations applied");
        Ok(())
    }
}

fn validate_channel(channel: &str) -> Result<(), OutboxError> {
    let valid = !channel.is_empty()
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OutboxError::InfrastructureError {
            message: format!("Invalid notification channel name: {}", channel),
        })
    }
}

fn notify_function_sql(channel: &str) -> String {
    format!(
        r#"
        CREATE OR REPLACE FUNCTION notify_outbox_event() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify('{channel}', NEW.id::text);
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#
    )
}

/// A settle that found the event no longer claimed: missing, released as
/// stale, or already settled by another dispatcher
fn not_claimed(id: Uuid) -> OutboxError {
    OutboxError::InvalidStatus(format!("event {id} is not claimed for processing"))
}

fn interval_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[async_trait]
impl OutboxAppender<PgConnection> for PostgresOutboxRepository {
    async fn append(&self, tx: &mut PgConnection, event: &OutboxEvent) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_id, aggregate_type, event_type, event_version,
                payload, metadata, tenant_id, created_at, status, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0)
            "#,
        )
        .bind(event.event_id)
        .bind(event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(event.event_version)
        .bind(sqlx::types::Json(&event.payload))
        .bind(event.metadata.as_ref().map(sqlx::types::Json))
        .bind(&event.tenant_id)
        .bind(event.created_at)
        .execute(tx)
        .await?;

        debug!(event_id = %event.event_id, event_type = %event.event_type, "Outbox event appended");
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        let row = sqlx::query_as::<_, OutboxEventRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OutboxEvent::try_from).transpose()
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query_as::<_, OutboxEventRow>(&format!(
            "{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn mark_as_processing(&self, id: Uuid) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'processing', claimed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_as_processed(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'processed', processed_at = NOW(), last_error = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_claimed(id));
        }
        Ok(())
    }

    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed',
                retry_count = retry_count + 1,
                last_error = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_claimed(id));
        }
        Ok(())
    }

    async fn reset_failed(&self, id: Uuid) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', claimed_at = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stale_processing(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'processing'
            AND claimed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(interval_secs(older_than))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_stats(&self) -> Result<OutboxStats, OutboxError> {
        #[derive(FromRow)]
        struct StatsRow {
            pending_count: Option<i64>,
            processing_count: Option<i64>,
            processed_count: Option<i64>,
            failed_count: Option<i64>,
            oldest_pending_age_seconds: Option<i64>,
        }

        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(CASE WHEN status = 'pending' THEN 1 END) AS pending_count,
                COUNT(CASE WHEN status = 'processing' THEN 1 END) AS processing_count,
                COUNT(CASE WHEN status = 'processed' THEN 1 END) AS processed_count,
                COUNT(CASE WHEN status = 'failed' THEN 1 END) AS failed_count,
                CAST(MIN(CASE WHEN status = 'pending' THEN EXTRACT(EPOCH FROM (NOW() - created_at)) END) AS BIGINT) AS oldest_pending_age_seconds
            FROM outbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |value: Option<i64>| u64::try_from(value.unwrap_or(0)).unwrap_or(0);
        Ok(OutboxStats {
            pending_count: count(row.pending_count),
            processing_count: count(row.processing_count),
            processed_count: count(row.processed_count),
            failed_count: count(row.failed_count),
            oldest_pending_age_seconds: row.oldest_pending_age_seconds,
        })
    }

    async fn cleanup_processed(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status = 'processed'
            AND processed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(interval_secs(older_than))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_validation() {
        assert!(validate_channel(DEFAULT_NOTIFY_CHANNEL).is_ok());
        assert!(validate_channel("outbox_v2").is_ok());
        assert!(validate_channel("").is_err());
        assert!(validate_channel("outbox'; DROP TABLE x; --").is_err());
    }

    #[test]
    fn test_notify_function_uses_channel() {
        let sql = notify_function_sql("custom_channel");
        assert!(sql.contains("pg_notify('custom_channel', NEW.id::text)"));
        assert!(sql.contains("RETURNS trigger"));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let row = OutboxEventRow {
            id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            aggregate_type: "message".to_string(),
            event_type: "message.received".to_string(),
            event_version: 1,
            payload: sqlx::types::Json(serde_json::json!({})),
            metadata: None,
            tenant_id: None,
            created_at: Utc::now(),
            status: "PUBLISHED".to_string(),
            retry_count: 0,
            last_error: None,
            processed_at: None,
        };

        assert!(matches!(
            OutboxEvent::try_from(row),
            Err(OutboxError::InvalidStatus(_))
        ));
    }
}
