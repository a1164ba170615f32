//! Debounce buffer storage and batch hand-off ports

use std::time::Duration;

use async_trait::async_trait;

use super::model::{BufferedMessage, SessionKey};

/// Errors raised by the debouncer and its ports
#[derive(Debug, thiserror::Error)]
pub enum DebounceError {
    #[error("Buffer store error: {0}")]
    Store(String),

    #[error("Buffer serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch processing failed: {0}")]
    Processor(String),
}

/// Ordered per-conversation buffer storage
///
/// Keys are namespaced per conversation, so no cross-key locking is needed.
#[async_trait]
pub trait DebounceStore: Send + Sync {
    /// Append to the tail of the buffer and (re)arm its TTL
    async fn append(
        &self,
        key: &SessionKey,
        message: &BufferedMessage,
        ttl: Duration,
    ) -> Result<(), DebounceError>;

    /// Read the whole buffer in append order
    async fn read_all(&self, key: &SessionKey) -> Result<Vec<BufferedMessage>, DebounceError>;

    /// Drop the first `count` entries if the buffer still starts with
    /// `expected_head`
    ///
    /// Returns the number of entries left, or `None` when the head changed
    /// (another owner already flushed that prefix). Entries appended after the
    /// flushed snapshot survive.
    async fn remove_prefix(
        &self,
        key: &SessionKey,
        expected_head: &str,
        count: usize,
    ) -> Result<Option<usize>, DebounceError>;

    /// Delete the buffer
    async fn delete(&self, key: &SessionKey) -> Result<(), DebounceError>;
}

/// Receives a flushed batch, ordered by timestamp
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(
        &self,
        key: &SessionKey,
        messages: Vec<BufferedMessage>,
    ) -> Result<(), DebounceError>;
}
