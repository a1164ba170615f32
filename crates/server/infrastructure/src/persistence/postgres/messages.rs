//! PostgreSQL adapters for the message-side ports
//!
//! Minimal storage for messages, contacts and channel sessions. Recording an
//! inbound message writes the message row and its `message.received` outbox
//! event in one transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulso_server_domain::messaging::{
    ChannelConnectionState, ChannelStatusUpdater, ContactIdentifier, ContactIdentifierStore,
    InboundMessage, InboundMessageHandler, MessageDeliveryStatus, MessageRepository,
    MessageStatusUpdater, PortError, ProcessedMessage,
};
use pulso_server_domain::outbox::DomainEvent;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::messaging::outbox::OutboxPublisher;

fn storage_error(e: impl std::fmt::Display) -> PortError {
    PortError::Storage(e.to_string())
}

/// Create the message, contact and channel tables
pub async fn run_message_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id UUID PRIMARY KEY,
            session VARCHAR(200) NOT NULL,
            remote_id VARCHAR(200) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(session, remote_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contact_identifiers (
            contact_id UUID NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
            kind VARCHAR(50) NOT NULL,
            value VARCHAR(300) NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (contact_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            channel_message_id VARCHAR(300) NOT NULL UNIQUE,
            contact_id UUID REFERENCES contacts(id),
            session VARCHAR(200) NOT NULL,
            from_me BOOLEAN NOT NULL,
            body TEXT,
            has_media BOOLEAN NOT NULL DEFAULT FALSE,
            status VARCHAR(20),
            sent_at TIMESTAMPTZ NOT NULL,
            raw_payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_sessions (
            session VARCHAR(200) PRIMARY KEY,
            connection_state VARCHAR(30) NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Message migrations applied");
    Ok(())
}

/// Message lookups and delivery status updates
#[derive(Debug, Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageStore {
    async fn exists_by_channel_message_id(
        &self,
        channel_message_id: &str,
    ) -> Result<bool, PortError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE channel_message_id = $1)",
        )
        .bind(channel_message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(exists)
    }
}

#[async_trait]
impl MessageStatusUpdater for PostgresMessageStore {
    async fn update_delivery_status(
        &self,
        channel_message_id: &str,
        status: MessageDeliveryStatus,
    ) -> Result<(), PortError> {
        let result = sqlx::query("UPDATE messages SET status = $2 WHERE channel_message_id = $1")
            .bind(channel_message_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(channel_message_id.to_string()));
        }
        Ok(())
    }
}

/// Channel session connectivity
#[derive(Debug, Clone)]
pub struct PostgresChannelStatusUpdater {
    pool: PgPool,
}

impl PostgresChannelStatusUpdater {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelStatusUpdater for PostgresChannelStatusUpdater {
    async fn update_connection_state(
        &self,
        session: &str,
        state: ChannelConnectionState,
    ) -> Result<(), PortError> {
        sqlx::query(
            r#"
            INSERT INTO channel_sessions (session, connection_state, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (session)
            DO UPDATE SET connection_state = EXCLUDED.connection_state, updated_at = NOW()
            "#,
        )
        .bind(session)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }
}

/// Auxiliary contact identifiers, one value per kind
#[derive(Debug, Clone)]
pub struct PostgresContactIdentifierStore {
    pool: PgPool,
}

impl PostgresContactIdentifierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactIdentifierStore for PostgresContactIdentifierStore {
    async fn save_identifiers(
        &self,
        contact_id: Uuid,
        identifiers: &[ContactIdentifier],
    ) -> Result<(), PortError> {
        for identifier in identifiers {
            sqlx::query(
                r#"
                INSERT INTO contact_identifiers (contact_id, kind, value, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (contact_id, kind)
                DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                "#,
            )
            .bind(contact_id)
            .bind(&identifier.kind)
            .bind(&identifier.value)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        }
        Ok(())
    }
}

/// Domain event recorded when a new message is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecordedEvent {
    pub message_id: Uuid,
    pub contact_id: Uuid,
    pub channel_message_id: String,
    pub session: String,
    pub from_me: bool,
    pub text: Option<String>,
    pub has_media: bool,
    pub sent_at: DateTime<Utc>,
}

impl DomainEvent for MessageRecordedEvent {
    fn event_type(&self) -> &str {
        if self.from_me {
            "message.sent"
        } else {
            "message.received"
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.message_id
    }

    fn aggregate_type(&self) -> &str {
        "message"
    }
}

/// Records inbound messages together with their outbox event
pub struct PostgresInboundMessageRecorder {
    pool: PgPool,
    outbox: OutboxPublisher<PgConnection>,
}

impl PostgresInboundMessageRecorder {
    pub fn new(pool: PgPool, outbox: OutboxPublisher<PgConnection>) -> Self {
        Self { pool, outbox }
    }

    pub fn with_appender(
        pool: PgPool,
        appender: Arc<dyn pulso_server_domain::outbox::OutboxAppender<PgConnection>>,
    ) -> Self {
        Self::new(pool, OutboxPublisher::new(appender))
    }
}

#[async_trait]
impl InboundMessageHandler for PostgresInboundMessageRecorder {
    async fn handle(&self, message: InboundMessage) -> Result<ProcessedMessage, PortError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let contact_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO contacts (id, session, remote_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (session, remote_id) DO UPDATE SET remote_id = EXCLUDED.remote_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&message.session)
        .bind(&message.remote_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_error)?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (
                id, channel_message_id, contact_id, session, from_me,
                body, has_media, sent_at, raw_payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (channel_message_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&message.channel_message_id)
        .bind(contact_id)
        .bind(&message.session)
        .bind(message.from_me)
        .bind(&message.text)
        .bind(message.has_media)
        .bind(message.sent_at)
        .bind(sqlx::types::Json(&message.raw_payload))
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?;

        let message_id = match inserted {
            Some(id) => {
                let event = MessageRecordedEvent {
                    message_id: id,
                    contact_id,
                    channel_message_id: message.channel_message_id.clone(),
                    session: message.session.clone(),
                    from_me: message.from_me,
                    text: message.text.clone(),
                    has_media: message.has_media,
                    sent_at: message.sent_at,
                };
                self.outbox
                    .publish(&mut *tx, &event)
                    .await
                    .map_err(storage_error)?;
                id
            }
            None => {
                debug!(
                    channel_message_id = %message.channel_message_id,
                    "Message already recorded"
                );
                sqlx::query_scalar("SELECT id FROM messages WHERE channel_message_id = $1")
                    .bind(&message.channel_message_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(storage_error)?
            }
        };

        tx.commit().await.map_err(storage_error)?;

        Ok(ProcessedMessage {
            message_id,
            contact_id: Some(contact_id),
        })
    }
}
