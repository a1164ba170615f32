//! Outbox stores

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryNotifications, InMemoryOutboxRepository, InMemoryOutboxTx};
pub use postgres::{DEFAULT_NOTIFY_CHANNEL, PostgresOutboxRepository};
