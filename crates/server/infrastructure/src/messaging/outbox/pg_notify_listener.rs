//! PgNotifyListener - PostgreSQL LISTEN/NOTIFY wrapper
//!
//! Receives the ids emitted by the outbox insert trigger once the inserting
//! transaction commits. [`PgNotifySource`] opens a fresh listener whenever the
//! dispatcher needs to subscribe again.

use async_trait::async_trait;
use pulso_server_domain::outbox::{OutboxError, OutboxNotificationSource, OutboxNotifications};
use sqlx::postgres::{PgListener, PgPool};
use tracing::{debug, info};

/// Listener on the outbox notification channel
#[derive(Debug)]
pub struct PgNotifyListener {
    listener: PgListener,
    channel: String,
}

impl PgNotifyListener {
    /// Open a dedicated connection and LISTEN on `channel`
    pub async fn new(pool: &PgPool, channel: &str) -> Result<Self, OutboxError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        info!(channel, "Listening for outbox notifications");

        Ok(Self {
            listener,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl OutboxNotifications for PgNotifyListener {
    /// Next notified event id
    ///
    /// The underlying listener reconnects and re-subscribes after a dropped
    /// connection; notifications sent in that window are recovered by the
    /// fallback scan.
    async fn next_notification(&mut self) -> Result<Option<String>, OutboxError> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| OutboxError::Listener(e.to_string()))?;
        debug!(channel = %self.channel, payload = notification.payload(), "Outbox notification");
        Ok(Some(notification.payload().to_string()))
    }
}

/// Opens [`PgNotifyListener`]s on one channel
#[derive(Debug, Clone)]
pub struct PgNotifySource {
    pool: PgPool,
    channel: String,
}

impl PgNotifySource {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl OutboxNotificationSource for PgNotifySource {
    async fn subscribe(&self) -> Result<Box<dyn OutboxNotifications>, OutboxError> {
        Ok(Box::new(PgNotifyListener::new(&self.pool, &self.channel).await?))
    }
}
