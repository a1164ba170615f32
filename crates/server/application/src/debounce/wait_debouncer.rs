//! Wait/decision debouncer
//!
//! Every push appends its message to the conversation buffer and evaluates
//! [`DebounceDecision`]. Only the push whose message heads the buffer owns
//! the wait loop; concurrent pushes to the same conversation return
//! [`DebounceDecision::Ignore`] at once, so no distributed lock is needed.
//! The owner sleeps and re-evaluates until the conversation has been quiet
//! for the wait duration, or until the retry ceiling forces a flush.
//!
//! A flush removes only the prefix that was handed off, so fragments pushed
//! during the hand-off stay buffered and the flushing owner carries on with
//! them. A head whose owner is gone is taken over by the next push.

use std::sync::Arc;
use std::time::Duration;

use pulso_server_domain::debounce::{
    BatchProcessor, BufferedMessage, Clock, DebounceDecision, DebounceError, DebounceStore,
    SessionKey, SystemClock, sort_by_timestamp,
};
use pulso_shared::config::DebounceConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WaitDebouncerConfig {
    /// Quiet period after the newest fragment
    pub wait: Duration,
    /// Evaluation rounds before a flush is forced
    pub max_retries: u32,
    /// Lifetime of an untouched buffer
    pub buffer_ttl: Duration,
}

impl Default for WaitDebouncerConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(3),
            max_retries: 5,
            buffer_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&DebounceConfig> for WaitDebouncerConfig {
    fn from(config: &DebounceConfig) -> Self {
        Self {
            wait: config.wait(),
            max_retries: config.max_retries,
            buffer_ttl: config.buffer_ttl(),
        }
    }
}

pub struct MessageDebouncer {
    store: Arc<dyn DebounceStore>,
    processor: Arc<dyn BatchProcessor>,
    clock: Arc<dyn Clock>,
    config: WaitDebouncerConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl MessageDebouncer {
    pub fn new(
        store: Arc<dyn DebounceStore>,
        processor: Arc<dyn BatchProcessor>,
        config: WaitDebouncerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            clock: Arc::new(SystemClock),
            config,
            shutdown: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cancel pending waits when `shutdown` flips to `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Buffer `message` and run the decision loop if this push owns the buffer
    ///
    /// Returns `Proceed` when this call flushed the conversation, `Ignore`
    /// when another push owns it, and `Wait` when shutdown interrupted the
    /// wait (the buffer is kept and a later push takes it over).
    ///
    /// A head older than [`Self::ownership_timeout`] has no live owner (its
    /// hand-off failed or its wait was cancelled); the push that finds it
    /// takes the buffer over instead of ignoring it.
    pub async fn push(
        &self,
        key: &SessionKey,
        mut message: BufferedMessage,
    ) -> Result<DebounceDecision, DebounceError> {
        let message_id = message.message_id.clone();
        message.buffered_at_millis = self.clock.now_millis();
        self.store
            .append(key, &message, self.config.buffer_ttl)
            .await?;

        let buffer = self.store.read_all(key).await?;
        let Some(head) = buffer.first() else {
            debug!(session_key = %key, message_id = %message_id, "Message already flushed by the owner");
            return Ok(DebounceDecision::Ignore);
        };
        if head.message_id != message_id {
            if !head.is_stranded(self.clock.now_millis(), self.ownership_timeout()) {
                debug!(session_key = %key, message_id = %message_id, "Buffer owned by another push");
                return Ok(DebounceDecision::Ignore);
            }
            warn!(
                session_key = %key,
                head = %head.message_id,
                message_id = %message_id,
                "Buffer head has no live owner, taking over"
            );
        }

        let owner = head.message_id.clone();
        self.own(key, owner).await
    }

    /// How long a head may stay buffered before its owner counts as gone
    ///
    /// One round more than the owner's whole wait loop.
    pub fn ownership_timeout(&self) -> Duration {
        self.config.wait * (self.rounds() + 1)
    }

    fn rounds(&self) -> u32 {
        self.config.max_retries.max(1)
    }

    /// Decision loop for the buffer headed by `owner`
    ///
    /// Fragments that arrive while a batch is being handed off stay in the
    /// buffer; the loop keeps ownership of the new head until nothing is left.
    async fn own(&self, key: &SessionKey, mut owner: String) -> Result<DebounceDecision, DebounceError> {
        let rounds = self.rounds();
        let mut flushed = false;

        'buffer: loop {
            for round in 1..=rounds {
                let buffer = self.store.read_all(key).await?;
                let decision = DebounceDecision::evaluate(
                    &buffer,
                    &owner,
                    self.clock.now_millis(),
                    self.config.wait,
                );

                match decision {
                    DebounceDecision::Ignore if flushed => return Ok(DebounceDecision::Proceed),
                    DebounceDecision::Ignore => {
                        debug!(session_key = %key, owner = %owner, "Buffer owned by another push");
                        return Ok(DebounceDecision::Ignore);
                    }
                    DebounceDecision::Wait if round < rounds => {
                        debug!(session_key = %key, round, "Conversation active, waiting");
                        if self.pause().await {
                            info!(session_key = %key, "Debounce wait cancelled by shutdown");
                            return Ok(DebounceDecision::Wait);
                        }
                    }
                    DebounceDecision::Wait | DebounceDecision::Proceed => {
                        if decision == DebounceDecision::Wait {
                            warn!(session_key = %key, rounds, "Conversation still active, forcing flush");
                        }
                        let remaining = self.flush(key, buffer).await?;
                        flushed = true;
                        if remaining == 0 {
                            return Ok(DebounceDecision::Proceed);
                        }

                        let Some(next) = self.store.read_all(key).await?.into_iter().next() else {
                            return Ok(DebounceDecision::Proceed);
                        };
                        debug!(
                            session_key = %key,
                            remaining,
                            head = %next.message_id,
                            "Fragments arrived during flush, keeping ownership"
                        );
                        owner = next.message_id;
                        continue 'buffer;
                    }
                }
            }

            return Ok(DebounceDecision::Wait);
        }
    }

    /// Flush whatever is buffered for `key` now
    pub async fn force_flush(&self, key: &SessionKey) -> Result<usize, DebounceError> {
        let buffer = self.store.read_all(key).await?;
        if buffer.is_empty() {
            return Ok(0);
        }
        let count = buffer.len();
        self.flush(key, buffer).await?;
        Ok(count)
    }

    /// Drop the buffer for `key` without processing it
    pub async fn force_clear(&self, key: &SessionKey) -> Result<(), DebounceError> {
        self.store.delete(key).await?;
        debug!(session_key = %key, "Buffer cleared");
        Ok(())
    }

    /// Hand the ordered snapshot to the processor, then remove exactly that
    /// prefix from the buffer
    ///
    /// Returns how many entries remain. A failed hand-off keeps the buffer.
    async fn flush(
        &self,
        key: &SessionKey,
        snapshot: Vec<BufferedMessage>,
    ) -> Result<usize, DebounceError> {
        let Some(head) = snapshot.first().map(|m| m.message_id.clone()) else {
            return Ok(0);
        };
        let count = snapshot.len();
        let mut messages = snapshot;
        sort_by_timestamp(&mut messages);

        if let Err(e) = self.processor.process_batch(key, messages).await {
            error!(session_key = %key, error = %e, "Batch processing failed, buffer kept");
            return Err(e);
        }

        match self.store.remove_prefix(key, &head, count).await? {
            Some(remaining) => {
                info!(session_key = %key, count, remaining, "Conversation flushed");
                Ok(remaining)
            }
            None => {
                warn!(session_key = %key, count, "Buffer was flushed concurrently by another owner");
                Ok(0)
            }
        }
    }

    /// Sleep for the wait duration; `true` when shutdown interrupted it
    async fn pause(&self) -> bool {
        let Some(mut shutdown) = self.shutdown.clone() else {
            tokio::time::sleep(self.config.wait).await;
            return false;
        };
        if *shutdown.borrow() {
            return true;
        }

        let sleep = tokio::time::sleep(self.config.wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        return false;
                    }
                    if *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct MemoryStore {
        buffers: Mutex<HashMap<String, Vec<BufferedMessage>>>,
    }

    #[async_trait]
    impl DebounceStore for MemoryStore {
        async fn append(
            &self,
            key: &SessionKey,
            message: &BufferedMessage,
            _ttl: Duration,
        ) -> Result<(), DebounceError> {
            self.buffers
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(message.clone());
            Ok(())
        }

        async fn read_all(&self, key: &SessionKey) -> Result<Vec<BufferedMessage>, DebounceError> {
            Ok(self
                .buffers
                .lock()
                .unwrap()
                .get(&key.to_string())
                .cloned()
                .unwrap_or_default())
        }

        async fn remove_prefix(
            &self,
            key: &SessionKey,
            expected_head: &str,
            count: usize,
        ) -> Result<Option<usize>, DebounceError> {
            let mut buffers = self.buffers.lock().unwrap();
            let Some(buffer) = buffers.get_mut(&key.to_string()) else {
                return Ok(None);
            };
            if buffer.first().map(|m| m.message_id.as_str()) != Some(expected_head) {
                return Ok(None);
            }
            buffer.drain(..count.min(buffer.len()));
            let remaining = buffer.len();
            if remaining == 0 {
                buffers.remove(&key.to_string());
            }
            Ok(Some(remaining))
        }

        async fn delete(&self, key: &SessionKey) -> Result<(), DebounceError> {
            self.buffers.lock().unwrap().remove(&key.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProcessor {
        batches: Mutex<Vec<Vec<BufferedMessage>>>,
        delay: Duration,
        failures_left: Mutex<u32>,
    }

    impl RecordingProcessor {
        fn ids(&self) -> Vec<Vec<String>> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|batch| batch.iter().map(|m| m.message_id.clone()).collect())
                .collect()
        }
    }

    #[async_trait]
    impl BatchProcessor for RecordingProcessor {
        async fn process_batch(
            &self,
            _key: &SessionKey,
            messages: Vec<BufferedMessage>,
        ) -> Result<(), DebounceError> {
            tokio::time::sleep(self.delay).await;
            {
                let mut failures_left = self.failures_left.lock().unwrap();
                if *failures_left > 0 {
                    *failures_left -= 1;
                    return Err(DebounceError::Processor("downstream down".to_string()));
                }
            }
            self.batches.lock().unwrap().push(messages);
            Ok(())
        }
    }

    /// Millisecond clock following tokio's (pausable) time
    struct TokioClock {
        start: Instant,
    }

    impl Clock for TokioClock {
        fn now_millis(&self) -> i64 {
            self.start.elapsed().as_millis() as i64
        }
    }

    struct Fixture {
        debouncer: Arc<MessageDebouncer>,
        store: Arc<MemoryStore>,
        processor: Arc<RecordingProcessor>,
        clock: Arc<TokioClock>,
    }

    fn fixture(wait_ms: u64, max_retries: u32) -> Fixture {
        fixture_with(RecordingProcessor::default(), wait_ms, max_retries)
    }

    fn fixture_with(processor: RecordingProcessor, wait_ms: u64, max_retries: u32) -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let processor = Arc::new(processor);
        let clock = Arc::new(TokioClock {
            start: Instant::now(),
        });
        let debouncer = MessageDebouncer::new(
            store.clone(),
            processor.clone(),
            WaitDebouncerConfig {
                wait: Duration::from_millis(wait_ms),
                max_retries,
                buffer_ttl: Duration::from_secs(60),
            },
        )
        .with_clock(clock.clone());
        Fixture {
            debouncer: Arc::new(debouncer),
            store,
            processor,
            clock,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("contact-1", "whatsapp", "channel-1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_conversation_flushes_after_wait() {
        let f = fixture(100, 5);
        let started = Instant::now();
        let message = BufferedMessage::text("m1", "hola", f.clock.now_millis());

        let decision = f.debouncer.push(&key(), message).await.unwrap();

        assert_eq!(decision, DebounceDecision::Proceed);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(f.processor.batches.lock().unwrap().len(), 1);
        assert!(f.store.read_all(&key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_buffer_head_owns_the_wait_loop() {
        let f = fixture(100, 5);
        let mut handles = Vec::new();
        for i in 0..5 {
            let debouncer = f.debouncer.clone();
            let message = BufferedMessage::text(format!("m{i}"), "part", f.clock.now_millis());
            handles.push(tokio::spawn(async move { debouncer.push(&key(), message).await }));
        }

        let mut decisions = Vec::new();
        for handle in handles {
            decisions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(decisions[0], DebounceDecision::Proceed);
        assert!(decisions[1..].iter().all(|d| *d == DebounceDecision::Ignore));
        let batches = f.processor.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_conversation_is_forced_at_retry_ceiling() {
        let f = fixture(100, 3);
        let started = Instant::now();
        // Always newer than "now": the conversation never looks quiet
        let message = BufferedMessage::text("m1", "typing", f.clock.now_millis() + 60_000);

        let decision = f.debouncer.push(&key(), message).await.unwrap();

        assert_eq!(decision, DebounceDecision::Proceed);
        // Rounds 1 and 2 wait, round 3 forces
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(f.processor.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_flush_orders_by_timestamp() {
        let f = fixture(1000, 5);
        for (id, ts) in [("a", 3000), ("b", 1000), ("c", 2000)] {
            f.store
                .append(&key(), &BufferedMessage::text(id, id, ts), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let flushed = f.debouncer.force_flush(&key()).await.unwrap();

        assert_eq!(flushed, 3);
        let batches = f.processor.batches.lock().unwrap();
        let order: Vec<i64> = batches[0].iter().map(|m| m.timestamp_millis).collect();
        assert_eq!(order, vec![1000, 2000, 3000]);
        assert!(f.store.buffers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_flush_of_empty_buffer_is_noop() {
        let f = fixture(1000, 5);
        assert_eq!(f.debouncer.force_flush(&key()).await.unwrap(), 0);
        assert!(f.processor.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_clear_drops_buffer() {
        let f = fixture(1000, 5);
        f.store
            .append(&key(), &BufferedMessage::text("a", "x", 1), Duration::from_secs(60))
            .await
            .unwrap();

        f.debouncer.force_clear(&key()).await.unwrap();

        assert!(f.store.read_all(&key()).await.unwrap().is_empty());
        assert!(f.processor.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_pushed_during_handoff_is_flushed_next() {
        let processor = RecordingProcessor {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let f = fixture_with(processor, 100, 5);
        let owner = tokio::spawn({
            let debouncer = f.debouncer.clone();
            let message = BufferedMessage::text("m1", "hola", f.clock.now_millis());
            async move { debouncer.push(&key(), message).await }
        });

        // m1 is quiet at t=100 and its hand-off runs until t=150
        tokio::time::sleep(Duration::from_millis(120)).await;
        let late = BufferedMessage::text("m2", "sigo aqui", f.clock.now_millis());
        let second = f.debouncer.push(&key(), late).await.unwrap();

        assert_eq!(second, DebounceDecision::Ignore);
        assert_eq!(owner.await.unwrap().unwrap(), DebounceDecision::Proceed);
        assert_eq!(f.processor.ids(), vec![vec!["m1"], vec!["m2"]]);
        assert!(f.store.read_all(&key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_after_failed_handoff_is_taken_over() {
        let processor = RecordingProcessor {
            failures_left: Mutex::new(1),
            ..Default::default()
        };
        let f = fixture_with(processor, 100, 2);
        assert_eq!(f.debouncer.ownership_timeout(), Duration::from_millis(300));

        let first = f
            .debouncer
            .push(&key(), BufferedMessage::text("m1", "a", f.clock.now_millis()))
            .await;
        assert!(matches!(first, Err(DebounceError::Processor(_))));

        // Head still within its owner's lifetime
        tokio::time::sleep(Duration::from_millis(100)).await;
        let ignored = f
            .debouncer
            .push(&key(), BufferedMessage::text("m2", "b", f.clock.now_millis()))
            .await
            .unwrap();
        assert_eq!(ignored, DebounceDecision::Ignore);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let taken_over = f
            .debouncer
            .push(&key(), BufferedMessage::text("m3", "c", f.clock.now_millis()))
            .await
            .unwrap();

        assert_eq!(taken_over, DebounceDecision::Proceed);
        assert_eq!(f.processor.ids(), vec![vec!["m1", "m2", "m3"]]);
        assert!(f.store.read_all(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_flush_keeps_newer_entries() {
        let f = fixture(1000, 5);
        for id in ["a", "b"] {
            f.store
                .append(&key(), &BufferedMessage::text(id, id, 1), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(f.store.remove_prefix(&key(), "x", 1).await.unwrap(), None);
        assert_eq!(f.store.remove_prefix(&key(), "a", 1).await.unwrap(), Some(1));
        assert_eq!(f.store.read_all(&key()).await.unwrap()[0].message_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_wait_and_keeps_buffer() {
        let store = Arc::new(MemoryStore::default());
        let processor = Arc::new(RecordingProcessor::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let clock = Arc::new(TokioClock {
            start: Instant::now(),
        });
        let debouncer = MessageDebouncer::new(
            store.clone(),
            processor.clone(),
            WaitDebouncerConfig {
                wait: Duration::from_secs(10),
                max_retries: 5,
                buffer_ttl: Duration::from_secs(60),
            },
        )
        .with_clock(clock.clone())
        .with_shutdown(shutdown_rx);

        let debouncer = Arc::new(debouncer);
        let pusher = debouncer.clone();
        let handle = tokio::spawn(async move {
            pusher
                .push(&key(), BufferedMessage::text("m1", "hola", 0))
                .await
        });
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), DebounceDecision::Wait);
        assert!(processor.batches.lock().unwrap().is_empty());
        assert_eq!(store.read_all(&key()).await.unwrap().len(), 1);

        // After a restart the next push adopts the cancelled owner's buffer
        let restarted = MessageDebouncer::new(
            store.clone(),
            processor.clone(),
            WaitDebouncerConfig {
                wait: Duration::from_secs(10),
                max_retries: 5,
                buffer_ttl: Duration::from_secs(600),
            },
        )
        .with_clock(clock.clone());
        tokio::time::sleep(restarted.ownership_timeout()).await;

        let decision = restarted
            .push(&key(), BufferedMessage::text("m2", "de vuelta", clock.now_millis()))
            .await
            .unwrap();

        assert_eq!(decision, DebounceDecision::Proceed);
        assert_eq!(processor.ids(), vec![vec!["m1", "m2"]]);
    }
}
