//! Outbox write path

use std::sync::Arc;

use pulso_server_domain::outbox::{DomainEvent, OutboxAppender, OutboxError, OutboxEvent};
use tracing::debug;
use uuid::Uuid;

/// Appends domain events to the outbox inside an open transaction
///
/// Never opens or commits a transaction and never touches the broker: the
/// event becomes dispatchable when the caller commits.
pub struct OutboxPublisher<Tx: ?Sized + Send> {
    appender: Arc<dyn OutboxAppender<Tx>>,
}

impl<Tx: ?Sized + Send> Clone for OutboxPublisher<Tx> {
    fn clone(&self) -> Self {
        Self {
            appender: self.appender.clone(),
        }
    }
}

impl<Tx: ?Sized + Send> OutboxPublisher<Tx> {
    pub fn new(appender: Arc<dyn OutboxAppender<Tx>>) -> Self {
        Self { appender }
    }

    /// Serialize `event` and stage it as a pending outbox record
    ///
    /// Returns the id of the new record.
    pub async fn publish<E: DomainEvent>(&self, tx: &mut Tx, event: &E) -> Result<Uuid, OutboxError> {
        let record = OutboxEvent::from_domain_event(event)?;
        self.appender.append(tx, &record).await?;
        debug!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            "Event appended to outbox"
        );
        Ok(record.event_id)
    }
}
