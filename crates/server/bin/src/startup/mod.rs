//! Startup module - wires the event backbone together.
//!
//! Order matters: storage and migrations first, then the broker and its
//! topology, then every consumer loop. All loops share one shutdown signal.

pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use pulso_server_application::debounce::{
    MessageDebouncer, PublishingBatchProcessor, WaitDebouncerConfig, WindowDebouncer,
    WindowDebouncerConfig,
};
use pulso_server_application::webhooks::WebhookMessageHandler;
use pulso_server_domain::debounce::BatchProcessor;
use pulso_server_domain::outbox::{OutboxNotificationSource, OutboxRepository};
use pulso_server_domain::queue::{MessageConsumer, QueueTransport, standard_topology};
use pulso_server_infrastructure::debounce::RedisDebounceStore;
use pulso_server_infrastructure::messaging::{
    CircuitBreakerTransport, DebounceFeedConsumer, DebounceTarget, EventLogWriter,
    NatsQueueTransport, NatsTransportConfig, OutboxDispatcher, OutboxDispatcherConfig,
    ParsedMessageConsumer, PgNotifySource, PostgresEventLogSink, RawEventBus,
    RawEventProcessor, WebhookPorts,
};
use pulso_server_infrastructure::persistence::postgres::{
    PostgresChannelStatusUpdater, PostgresContactIdentifierStore, PostgresInboundMessageRecorder,
    PostgresMessageStore, run_message_migrations,
};
use pulso_server_infrastructure::persistence::{DatabasePool, PostgresOutboxRepository};
use pulso_shared::config::{DebounceStrategy, ServerConfigDto};
use pulso_shared::queue_names::{RAW_EVENTS, domain_event_queue, parsed};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shutdown::{GracefulShutdown, ShutdownConfig};

/// Current application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Domain event the debouncer is fed from
const MESSAGE_RECEIVED_EVENT: &str = "message.received";

/// Capacity of the raw event log queue
const EVENT_LOG_CAPACITY: usize = 1024;

/// Processed outbox events older than this are deleted
const OUTBOX_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const OUTBOX_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

type Tasks = Vec<(&'static str, JoinHandle<()>)>;

/// Run the server until SIGINT/SIGTERM
pub async fn run(config: ServerConfigDto) -> anyhow::Result<()> {
    info!("Starting Pulso event backbone v{}", APP_VERSION);

    let shutdown = GracefulShutdown::new(ShutdownConfig::default());
    shutdown.start_signal_handler();
    let mut tasks: Tasks = Vec::new();

    // Step 1: Database and migrations
    let database = DatabasePool::from_config(&config.database).await?;
    let pool = database.pg_pool();
    info!("✓ Database connected");

    let outbox = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    outbox.run_migrations(&config.outbox.notify_channel).await?;
    run_message_migrations(&pool).await?;
    let event_log_sink = PostgresEventLogSink::new(pool.clone());
    event_log_sink.run_migrations().await?;
    info!("✓ Migrations applied");

    // Step 2: Broker
    let nats = NatsQueueTransport::connect(NatsTransportConfig::from(&config.nats), shutdown.subscribe()).await?;
    if let Some(supervisor) = nats.spawn_supervisor(shutdown.subscribe()) {
        tasks.push(("nats-supervisor", supervisor));
    }
    let transport: Arc<dyn QueueTransport> = if config.nats.circuit_breaker_enabled {
        Arc::new(CircuitBreakerTransport::with_default_config(nats))
    } else {
        Arc::new(nats)
    };

    let feed_queue = domain_event_queue(MESSAGE_RECEIVED_EVENT);
    transport.setup_all_queues(&standard_topology()).await?;
    transport.declare_queue(&feed_queue).await?;
    info!("✓ Queue topology declared");

    // Step 3: Raw webhook pipeline
    let (event_log, event_log_task) = EventLogWriter::spawn(Arc::new(event_log_sink), EVENT_LOG_CAPACITY);
    let event_log_counter = event_log.clone();
    let bus = RawEventBus::new(transport.clone()).with_event_log(event_log);

    let message_store = Arc::new(PostgresMessageStore::new(pool.clone()));
    let recorder = Arc::new(PostgresInboundMessageRecorder::with_appender(
        pool.clone(),
        outbox.clone(),
    ));
    let message_handler = Arc::new(WebhookMessageHandler::new(
        message_store.clone(),
        recorder,
        Arc::new(PostgresContactIdentifierStore::new(pool.clone())),
    ));
    let ports = WebhookPorts {
        messages: message_handler.clone(),
        message_status: message_store,
        channel_status: Arc::new(PostgresChannelStatusUpdater::new(pool.clone())),
    };

    let prefetch = config.nats.prefetch;
    tasks.push((
        "raw-event-consumer",
        spawn_consumer(
            transport.clone(),
            RAW_EVENTS.to_string(),
            "raw-event-processor",
            Arc::new(RawEventProcessor::new(bus.clone(), ports)),
            prefetch,
            shutdown.subscribe(),
        ),
    ));
    tasks.push((
        "parsed-message-consumer",
        spawn_consumer(
            transport.clone(),
            parsed::MESSAGE.to_string(),
            "parsed-message-consumer",
            Arc::new(ParsedMessageConsumer::new(message_handler)),
            prefetch,
            shutdown.subscribe(),
        ),
    ));

    // Step 4: Outbox dispatcher
    let dispatcher = Arc::new(OutboxDispatcher::new(
        outbox.clone(),
        transport.clone(),
        OutboxDispatcherConfig::from(&config.outbox),
    ));
    let notifications: Arc<dyn OutboxNotificationSource> =
        Arc::new(PgNotifySource::new(pool.clone(), config.outbox.notify_channel.clone()));
    tasks.push(("outbox-dispatcher", {
        let dispatcher = dispatcher.clone();
        let stop = shutdown.subscribe();
        tokio::spawn(async move { dispatcher.run(Some(notifications), stop).await })
    }));
    tasks.push((
        "outbox-cleanup",
        spawn_outbox_cleanup(outbox.clone(), shutdown.subscribe()),
    ));

    // Step 5: Debouncer
    let processor: Arc<dyn BatchProcessor> = Arc::new(PublishingBatchProcessor::new(transport.clone()));
    let target = match config.debounce.strategy {
        DebounceStrategy::Wait => {
            let store = RedisDebounceStore::connect(&config.redis).await?;
            let debouncer = MessageDebouncer::new(
                Arc::new(store),
                processor,
                WaitDebouncerConfig::from(&config.debounce),
            )
            .with_shutdown(shutdown.subscribe());
            DebounceTarget::Wait(Arc::new(debouncer))
        }
        DebounceStrategy::Window => {
            let debouncer = Arc::new(WindowDebouncer::new(
                processor,
                WindowDebouncerConfig::from(&config.debounce),
            ));
            tasks.push(("debounce-sweep", {
                let debouncer = debouncer.clone();
                let stop = shutdown.subscribe();
                tokio::spawn(async move { debouncer.run(stop).await })
            }));
            DebounceTarget::Window(debouncer)
        }
    };
    info!(strategy = ?config.debounce.strategy, "✓ Debouncer ready");
    tasks.push((
        "debounce-feed",
        spawn_consumer(
            transport.clone(),
            feed_queue,
            "debounce-feed",
            Arc::new(DebounceFeedConsumer::new(target)),
            prefetch,
            shutdown.subscribe(),
        ),
    ));

    info!("✓ Pulso running");

    let reason = shutdown.wait().await;
    info!(reason = ?reason, "Shutting down");

    let clean = shutdown.drain(tasks).await;

    // The writer task ends once the last writer clone is gone
    let event_log_dropped = event_log_counter.dropped();
    drop(event_log_counter);
    drop(bus);
    let drained = shutdown.drain(vec![("event-log-writer", event_log_task)]).await && clean;

    let metrics = dispatcher.metrics();
    info!(
        push_dispatched = metrics.push_dispatched(),
        fallback_dispatched = metrics.fallback_dispatched(),
        lost_claims = metrics.lost_claims(),
        publish_failures = metrics.publish_failures(),
        "Outbox dispatcher totals"
    );
    if event_log_dropped > 0 {
        warn!(dropped = event_log_dropped, "Event log entries were dropped");
    }

    database.pool().close().await;
    if drained {
        info!("Shutdown complete");
    } else {
        warn!("Shutdown completed with unfinished tasks");
    }
    Ok(())
}

fn spawn_consumer(
    transport: Arc<dyn QueueTransport>,
    queue: String,
    tag: &'static str,
    consumer: Arc<dyn MessageConsumer>,
    prefetch: u16,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = transport
            .start_consumer(&queue, tag, consumer, prefetch, shutdown)
            .await
        {
            error!(queue = %queue, tag, error = %e, "Consumer failed to start");
        }
    })
}

/// Periodically report outbox counts and delete old processed events
fn spawn_outbox_cleanup(
    repository: Arc<dyn OutboxRepository>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OUTBOX_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match repository.get_stats().await {
                        Ok(stats) => info!(
                            pending = stats.pending_count,
                            processing = stats.processing_count,
                            failed = stats.failed_count,
                            oldest_pending_secs = ?stats.oldest_pending_age_seconds,
                            "Outbox stats"
                        ),
                        Err(e) => warn!(error = %e, "Failed to read outbox stats"),
                    }
                    match repository.cleanup_processed(OUTBOX_RETENTION).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "Processed outbox events cleaned up"),
                        Err(e) => warn!(error = %e, "Outbox cleanup failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
