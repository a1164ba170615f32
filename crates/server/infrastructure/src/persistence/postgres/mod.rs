//! PostgreSQL pool and message-side adapters

pub mod messages;
pub mod pool;

pub use messages::{
    MessageRecordedEvent, PostgresChannelStatusUpdater, PostgresContactIdentifierStore,
    PostgresInboundMessageRecorder, PostgresMessageStore, run_message_migrations,
};
pub use pool::{DatabasePool, DatabasePoolConfig, PoolError};
