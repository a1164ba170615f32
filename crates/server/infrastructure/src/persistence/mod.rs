//! Persistence adapters

pub mod outbox;
pub mod postgres;

pub use outbox::{InMemoryOutboxRepository, InMemoryOutboxTx, PostgresOutboxRepository};
pub use postgres::{DatabasePool, DatabasePoolConfig};
