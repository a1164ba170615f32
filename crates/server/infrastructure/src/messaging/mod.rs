//! Messaging adapters
//!
//! Queue transports (NATS JetStream, in-memory, circuit-breaker decorator),
//! the raw webhook pipeline and the outbox dispatcher.

pub mod circuit_breaker_transport;
pub mod debounce_feed;
pub mod event_log;
pub mod in_memory;
pub mod nats;
pub mod outbox;
pub mod parsed_consumer;
pub mod raw_event_bus;
pub mod raw_event_processor;

pub use circuit_breaker_transport::CircuitBreakerTransport;
pub use debounce_feed::{DebounceFeedConsumer, DebounceTarget};
pub use event_log::{
    EventLogEntry, EventLogError, EventLogOutcome, EventLogSink, EventLogWriter,
    PostgresEventLogSink, TracingEventLogSink,
};
pub use in_memory::InMemoryQueueTransport;
pub use nats::{NatsQueueTransport, NatsTransportConfig};
pub use outbox::{
    DispatchOutcome, DispatchTrigger, OutboxDispatcher, OutboxDispatcherConfig,
    OutboxDispatcherMetrics, OutboxPublisher, PgNotifyListener, PgNotifySource,
};
pub use parsed_consumer::ParsedMessageConsumer;
pub use raw_event_bus::RawEventBus;
pub use raw_event_processor::{RawEventProcessor, WebhookPorts};

use std::time::Duration;

use tokio::sync::watch;

/// Sleep for `delay` unless shutdown is signalled first
///
/// Returns `true` when the caller should stop.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
