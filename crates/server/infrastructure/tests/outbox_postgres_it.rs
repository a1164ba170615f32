//! Outbox store and dispatcher against a real PostgreSQL
//!
//! Run with: cargo test --test outbox_postgres_it -- --ignored

mod common;

use std::sync::Arc;
use std::time::Duration;

use pulso_server_domain::outbox::{
    OutboxAppender, OutboxError, OutboxEvent, OutboxNotificationSource, OutboxNotifications,
    OutboxRepository, OutboxStatus,
};
use pulso_server_infrastructure::messaging::{
    InMemoryQueueTransport, OutboxDispatcher, OutboxDispatcherConfig, PgNotifyListener,
    PgNotifySource,
};
use pulso_server_infrastructure::persistence::PostgresOutboxRepository;
use pulso_shared::queue_names::domain_event_queue;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

const CHANNEL: &str = "outbox_events_it";

async fn setup() -> anyhow::Result<(common::PostgresTestDatabase, sqlx::PgPool, Arc<PostgresOutboxRepository>)> {
    let db = common::get_postgres_context().await;
    let pool = db.pool().await;
    let repository = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    repository.run_migrations(CHANNEL).await?;
    Ok((db, pool, repository))
}

fn contact_created() -> OutboxEvent {
    OutboxEvent::pending(
        Uuid::new_v4(),
        "contact",
        "contact.created",
        json!({"name": "Ana"}),
    )
}

async fn append_committed(
    pool: &sqlx::PgPool,
    repository: &PostgresOutboxRepository,
    event: &OutboxEvent,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    repository.append(&mut *tx, event).await?;
    tx.commit().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn committed_insert_notifies_listener_with_event_id() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    let mut listener = PgNotifyListener::new(&pool, CHANNEL).await?;

    let event = contact_created();
    append_committed(&pool, &repository, &event).await?;

    let payload = timeout(Duration::from_secs(5), listener.next_notification()).await??;
    assert_eq!(payload, Some(event.event_id.to_string()));
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn rolled_back_insert_leaves_no_event() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;

    let event = contact_created();
    let mut tx = pool.begin().await?;
    repository.append(&mut *tx, &event).await?;
    tx.rollback().await?;

    assert!(repository.find_by_id(event.event_id).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn claim_succeeds_once() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    let event = contact_created();
    append_committed(&pool, &repository, &event).await?;

    let (first, second) = tokio::join!(
        repository.mark_as_processing(event.event_id),
        repository.mark_as_processing(event.event_id),
    );

    assert!(first? ^ second?);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn failed_event_can_be_reset_and_counted() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    let event = contact_created();
    append_committed(&pool, &repository, &event).await?;

    assert!(repository.mark_as_processing(event.event_id).await?);
    repository.mark_as_failed(event.event_id, "broker down").await?;

    let stored = repository.find_by_id(event.event_id).await?.expect("event stored");
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("broker down"));
    assert_eq!(repository.get_stats().await?.failed_count, 1);

    assert!(repository.reset_failed(event.event_id).await?);
    assert_eq!(repository.get_pending(10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn late_settle_keeps_reclaimed_event() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    let event = contact_created();
    append_committed(&pool, &repository, &event).await?;
    assert!(repository.mark_as_processing(event.event_id).await?);
    repository.mark_as_processed(event.event_id).await?;

    let late = repository.mark_as_failed(event.event_id, "timeout").await;
    assert!(matches!(late, Err(OutboxError::InvalidStatus(_))));

    let stored = repository.find_by_id(event.event_id).await?.expect("event stored");
    assert_eq!(stored.status, OutboxStatus::Processed);
    assert_eq!(stored.retry_count, 0);
    assert!(repository.mark_as_processed(Uuid::new_v4()).await.is_err());
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn stale_claims_are_released() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    let event = contact_created();
    append_committed(&pool, &repository, &event).await?;
    assert!(repository.mark_as_processing(event.event_id).await?);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let released = repository.release_stale_processing(Duration::from_secs(1)).await?;

    assert_eq!(released, 1);
    assert_eq!(repository.get_pending(10).await?[0].event_id, event.event_id);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn dispatcher_publishes_on_notification() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    let transport = InMemoryQueueTransport::new();
    let dispatcher = Arc::new(OutboxDispatcher::new(
        repository.clone(),
        Arc::new(transport.clone()),
        OutboxDispatcherConfig {
            batch_size: 10,
            poll_interval: Duration::from_secs(60),
            stale_processing_after: Duration::from_secs(300),
            resubscribe_backoff: Duration::from_millis(100),
        },
    ));
    let source: Arc<dyn OutboxNotificationSource> = Arc::new(PgNotifySource::new(pool.clone(), CHANNEL));
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = dispatcher.clone();
    let handle = tokio::spawn(async move { runner.run(Some(source), stop_rx).await });

    let event = contact_created();
    append_committed(&pool, &repository, &event).await?;

    let queue = domain_event_queue("contact.created");
    timeout(Duration::from_secs(5), async {
        while transport.is_empty(&queue) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    let published: serde_json::Value = serde_json::from_slice(&transport.pending(&queue)[0].body)?;
    assert_eq!(published, json!({"name": "Ana"}));
    let stored = repository.find_by_id(event.event_id).await?.expect("event stored");
    assert_eq!(stored.status, OutboxStatus::Processed);
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.push_dispatched() + metrics.fallback_dispatched(), 1);

    stop_tx.send(true)?;
    handle.await?;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn dispatcher_recovers_backlog_without_listener() -> anyhow::Result<()> {
    let (_db, pool, repository) = setup().await?;
    for _ in 0..3 {
        append_committed(&pool, &repository, &contact_created()).await?;
    }
    let transport = InMemoryQueueTransport::new();
    let dispatcher = OutboxDispatcher::new(
        repository.clone(),
        Arc::new(transport.clone()),
        OutboxDispatcherConfig::default(),
    );

    assert_eq!(dispatcher.fallback_tick().await, 3);

    assert_eq!(transport.len(&domain_event_queue("contact.created")), 3);
    assert!(transport.is_declared(&domain_event_queue("contact.created")));
    assert_eq!(repository.get_stats().await?.processed_count, 3);
    Ok(())
}
