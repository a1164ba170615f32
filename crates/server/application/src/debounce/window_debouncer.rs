//! Window/size debouncer
//!
//! Buffers per conversation in process memory. A push flushes at once when
//! the buffer reaches `max_batch_size`; otherwise a periodic sweep flushes
//! conversations whose newest message is older than `window`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pulso_server_domain::debounce::{
    BatchProcessor, BufferedMessage, Clock, DebounceError, SessionKey, SystemClock,
    sort_by_timestamp,
};
use pulso_shared::config::DebounceConfig;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct WindowDebouncerConfig {
    pub window: Duration,
    pub max_batch_size: usize,
    pub sweep_interval: Duration,
}

impl Default for WindowDebouncerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3),
            max_batch_size: 20,
            sweep_interval: Duration::from_millis(500),
        }
    }
}

impl From<&DebounceConfig> for WindowDebouncerConfig {
    fn from(config: &DebounceConfig) -> Self {
        Self {
            window: config.window(),
            max_batch_size: config.max_batch_size,
            sweep_interval: config.sweep_interval(),
        }
    }
}

pub struct WindowDebouncer {
    buffers: Mutex<HashMap<SessionKey, Vec<BufferedMessage>>>,
    processor: Arc<dyn BatchProcessor>,
    clock: Arc<dyn Clock>,
    config: WindowDebouncerConfig,
}

impl WindowDebouncer {
    pub fn new(processor: Arc<dyn BatchProcessor>, config: WindowDebouncerConfig) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            processor,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<SessionKey, Vec<BufferedMessage>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer `message`; returns `true` when the push filled and flushed the buffer
    pub async fn push(
        &self,
        key: &SessionKey,
        message: BufferedMessage,
    ) -> Result<bool, DebounceError> {
        let full = {
            let mut buffers = self.buffers();
            let buffer = buffers.entry(key.clone()).or_default();
            buffer.push(message);
            if buffer.len() >= self.config.max_batch_size.max(1) {
                buffers.remove(key)
            } else {
                None
            }
        };

        match full {
            Some(messages) => {
                debug!(session_key = %key, count = messages.len(), "Buffer full, flushing");
                self.hand_off(key, messages).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flush every conversation quiet for longer than the window
    ///
    /// Returns the number of conversations flushed. Every due conversation is
    /// attempted; the first failure is returned.
    pub async fn flush_expired(&self) -> Result<usize, DebounceError> {
        let now = self.clock.now_millis();
        let window = self.config.window.as_millis() as i64;

        let due: Vec<(SessionKey, Vec<BufferedMessage>)> = {
            let mut buffers = self.buffers();
            let keys: Vec<SessionKey> = buffers
                .iter()
                .filter(|(_, messages)| {
                    messages
                        .iter()
                        .map(|m| m.timestamp_millis)
                        .max()
                        .is_some_and(|newest| now.saturating_sub(newest) > window)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| buffers.remove(&key).map(|messages| (key, messages)))
                .collect()
        };

        let mut flushed = 0;
        let mut first_error = None;
        for (key, messages) in due {
            match self.hand_off(&key, messages).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Flush one conversation regardless of its age
    pub async fn flush(&self, key: &SessionKey) -> Result<usize, DebounceError> {
        let messages = self.buffers().remove(key).unwrap_or_default();
        if messages.is_empty() {
            return Ok(0);
        }
        let count = messages.len();
        self.hand_off(key, messages).await?;
        Ok(count)
    }

    /// Conversations currently buffered
    pub fn buffered_conversations(&self) -> usize {
        self.buffers().len()
    }

    /// Sweep on a fixed tick until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            window_ms = self.config.window.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "Starting window debouncer sweep"
        );
        let mut ticker = interval(self.config.sweep_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_expired().await {
                        error!(error = %e, "Debounce sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Window debouncer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Hand the ordered batch to the processor; on failure the messages go back in front
    async fn hand_off(
        &self,
        key: &SessionKey,
        mut messages: Vec<BufferedMessage>,
    ) -> Result<(), DebounceError> {
        sort_by_timestamp(&mut messages);
        let count = messages.len();

        match self.processor.process_batch(key, messages.clone()).await {
            Ok(()) => {
                info!(session_key = %key, count, "Conversation flushed");
                Ok(())
            }
            Err(e) => {
                error!(session_key = %key, error = %e, "Batch processing failed, re-buffering");
                let mut buffers = self.buffers();
                let buffer = buffers.entry(key.clone()).or_default();
                messages.append(buffer);
                *buffer = messages;
                Err(e)
            }
        }
    }
}
