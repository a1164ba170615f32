//! Process-local debounce buffers for single-node runs and tests

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pulso_server_domain::debounce::{BufferedMessage, DebounceError, DebounceStore, SessionKey};
use tokio::time::Instant;

struct Buffer {
    messages: Vec<BufferedMessage>,
    expires_at: Instant,
}

/// [`DebounceStore`] keeping buffers in a map, honoring TTLs lazily on access
#[derive(Default)]
pub struct InMemoryDebounceStore {
    buffers: Mutex<HashMap<SessionKey, Buffer>>,
}

impl InMemoryDebounceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<SessionKey, Buffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live (unexpired) buffers
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.buffers()
            .values()
            .filter(|b| b.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DebounceStore for InMemoryDebounceStore {
    async fn append(
        &self,
        key: &SessionKey,
        message: &BufferedMessage,
        ttl: Duration,
    ) -> Result<(), DebounceError> {
        let now = Instant::now();
        let mut buffers = self.buffers();
        let buffer = buffers.entry(key.clone()).or_insert_with(|| Buffer {
            messages: Vec::new(),
            expires_at: now,
        });
        if buffer.expires_at <= now {
            buffer.messages.clear();
        }
        buffer.messages.push(message.clone());
        buffer.expires_at = now + ttl;
        Ok(())
    }

    async fn read_all(&self, key: &SessionKey) -> Result<Vec<BufferedMessage>, DebounceError> {
        let now = Instant::now();
        let mut buffers = self.buffers();
        match buffers.get(key) {
            Some(buffer) if buffer.expires_at > now => Ok(buffer.messages.clone()),
            Some(_) => {
                buffers.remove(key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn remove_prefix(
        &self,
        key: &SessionKey,
        expected_head: &str,
        count: usize,
    ) -> Result<Option<usize>, DebounceError> {
        let now = Instant::now();
        let mut buffers = self.buffers();
        let Some(buffer) = buffers.get_mut(key).filter(|b| b.expires_at > now) else {
            return Ok(None);
        };
        if buffer.messages.first().map(|m| m.message_id.as_str()) != Some(expected_head) {
            return Ok(None);
        }
        buffer.messages.drain(..count.min(buffer.messages.len()));
        let remaining = buffer.messages.len();
        if remaining == 0 {
            buffers.remove(key);
        }
        Ok(Some(remaining))
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), DebounceError> {
        self.buffers().remove(key);
        Ok(())
    }
}
