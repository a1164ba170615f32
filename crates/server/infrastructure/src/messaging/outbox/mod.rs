//! Transactional outbox dispatch
//!
//! The write path ([`OutboxPublisher`]) appends events inside the caller's
//! transaction. The dispatch path ([`OutboxDispatcher`]) forwards committed
//! events to the queue transport, woken by database notifications
//! ([`PgNotifyListener`]) and by a periodic fallback scan.

pub mod dispatcher;
pub mod pg_notify_listener;
pub mod publisher;

pub use dispatcher::{
    DispatchOutcome, DispatchTrigger, OutboxDispatcher, OutboxDispatcherConfig,
    OutboxDispatcherMetrics,
};
pub use pg_notify_listener::{PgNotifyListener, PgNotifySource};
pub use publisher::OutboxPublisher;
