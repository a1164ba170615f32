//! NATS JetStream queue transport
//!
//! Maps the queue contract onto JetStream:
//! - a queue is a work-queue stream whose only subject is the queue name,
//!   consumed through a durable pull consumer with explicit acknowledgement
//! - a dead-letter queue is an ordinary stream named `<queue>.dlq`
//! - prior delivery attempts come from the delivery count of the message
//! - requeue is a negative acknowledgement, dead-lettering is a publish to the
//!   paired DLQ followed by a terminal acknowledgement
//!
//! The connection is an owned session handle, swapped atomically by the
//! supervisor when the broker connection is replaced. Callers fetch the
//! current session per operation and never keep it across a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_nats::connection::State as ConnectionState;
use async_nats::jetstream::consumer::pull::{Config as PullConsumerConfig, Stream as PullMessages};
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind, Context as JetStreamContext, Message};
use async_nats::{Client, ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pulso_server_domain::queue::{
    AckDecision, ConsumerError, DEFAULT_MAX_RETRIES, Delivery, MessageConsumer, QueueTransport,
    TransportError, dead_letter_headers,
};
use pulso_shared::config::NatsConfig;
use pulso_shared::queue_names::dlq_name;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::sleep_or_shutdown;

/// Connection and stream settings of the transport
#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    pub urls: Vec<String>,
    pub connection_timeout: Duration,
    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,
    /// Attempts per (re)connection before giving up
    pub max_reconnect_attempts: u32,
    pub stream_replicas: usize,
    /// Time a delivery may stay unacknowledged before redelivery
    pub ack_wait: Duration,
    pub client_name: String,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            connection_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            stream_replicas: 1,
            ack_wait: Duration::from_secs(30),
            client_name: "pulso-server".to_string(),
        }
    }
}

impl From<&NatsConfig> for NatsTransportConfig {
    fn from(config: &NatsConfig) -> Self {
        Self {
            urls: config.urls.clone(),
            connection_timeout: config.connect_timeout(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            stream_replicas: config.stream_replicas,
            ..Self::default()
        }
    }
}

/// A live connection plus its JetStream context
struct BrokerSession {
    client: Client,
    jetstream: JetStreamContext,
    generation: u64,
}

impl BrokerSession {
    fn new(client: Client, generation: u64) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            generation,
        }
    }
}

/// What the transport knows about a declared queue
#[derive(Debug, Clone)]
struct DeclaredQueue {
    stream: String,
    /// Set when declared with a dead-letter queue
    max_retries: Option<u32>,
}

/// Queue transport backed by NATS JetStream
#[derive(Clone)]
pub struct NatsQueueTransport {
    config: Arc<NatsTransportConfig>,
    session: Arc<RwLock<Arc<BrokerSession>>>,
    topology: Arc<RwLock<HashMap<String, DeclaredQueue>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<Event>>>>,
    events_tx: mpsc::UnboundedSender<Event>,
    channel_reopens: Arc<AtomicU64>,
}

impl NatsQueueTransport {
    /// Connect, retrying with a fixed delay up to the configured attempt count
    ///
    /// Gives up early once `shutdown` flips to `true`.
    pub async fn connect(
        config: NatsTransportConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Self::connect_with_retry(&config, &events_tx, &mut shutdown).await?;

        info!(
            urls = ?config.urls,
            client = %config.client_name,
            "Connected to NATS"
        );

        Ok(Self {
            config: Arc::new(config),
            session: Arc::new(RwLock::new(Arc::new(BrokerSession::new(client, 0)))),
            topology: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(Mutex::new(Some(events_rx))),
            events_tx,
            channel_reopens: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn open_client(
        config: &NatsTransportConfig,
        events_tx: &mpsc::UnboundedSender<Event>,
    ) -> Result<Client, TransportError> {
        let events = events_tx.clone();
        let options = ConnectOptions::new()
            .name(&config.client_name)
            .connection_timeout(config.connection_timeout)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    let _ = events.send(event);
                }
            });

        async_nats::connect_with_options(config.urls.join(","), options)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn connect_with_retry(
        config: &NatsTransportConfig,
        events_tx: &mpsc::UnboundedSender<Event>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Client, TransportError> {
        let max_attempts = config.max_reconnect_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match Self::open_client(config, events_tx).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "NATS connection attempt failed, retrying in {:?}",
                        config.reconnect_delay
                    );
                    if sleep_or_shutdown(config.reconnect_delay, shutdown).await {
                        info!(attempt, "Shutdown requested, no longer connecting to NATS");
                        return Err(TransportError::Connection(
                            "shutdown requested while connecting".to_string(),
                        ));
                    }
                }
                Err(e) => {
                    error!(attempt, error = %e, "Giving up connecting to NATS");
                    return Err(e);
                }
            }
        }
    }

    /// Current broker session; never hold it across a reconnect boundary
    fn session(&self) -> Arc<BrokerSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap_session(&self, client: Client) {
        let mut current = self.session.write().unwrap_or_else(PoisonError::into_inner);
        let generation = current.generation + 1;
        *current = Arc::new(BrokerSession::new(client, generation));
    }

    /// Replace the JetStream context on the current connection
    fn reopen_channel(&self) {
        let client = self.session().client.clone();
        self.swap_session(client);
        self.channel_reopens.fetch_add(1, Ordering::Relaxed);
        debug!("JetStream context reopened");
    }

    /// Number of times the JetStream context was reopened
    pub fn channel_reopens(&self) -> u64 {
        self.channel_reopens.load(Ordering::Relaxed)
    }

    /// Whether the current connection is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self.session().client.connection_state(),
            ConnectionState::Connected
        )
    }

    /// Spawn the connection supervisor
    ///
    /// Returns `None` if a supervisor was already started.
    pub fn spawn_supervisor(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let transport = self.clone();
        Some(tokio::spawn(async move {
            transport.supervise(events, shutdown).await;
        }))
    }

    async fn supervise(
        self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut check =
            tokio::time::interval(self.config.reconnect_delay.max(Duration::from_millis(100)));
        let mut disconnected_since: Option<Instant> = None;
        let give_up_after = self
            .config
            .reconnect_delay
            .saturating_mul(self.config.max_reconnect_attempts.max(1));

        info!("NATS connection supervisor started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = events.recv() => match event {
                    Event::Disconnected => {
                        warn!("NATS connection lost");
                        disconnected_since.get_or_insert_with(Instant::now);
                    }
                    Event::Connected => {
                        if disconnected_since.take().is_some() {
                            info!("NATS connection restored");
                            self.reopen_channel();
                        }
                    }
                    other => debug!(event = %other, "NATS client event"),
                },
                _ = check.tick() => {
                    let Some(since) = disconnected_since else {
                        continue;
                    };
                    if self.is_connected() {
                        disconnected_since = None;
                        continue;
                    }
                    if since.elapsed() < give_up_after {
                        continue;
                    }

                    warn!(
                        down_for = ?since.elapsed(),
                        "NATS client did not recover, replacing connection"
                    );
                    match Self::connect_with_retry(&self.config, &self.events_tx, &mut shutdown).await {
                        Ok(client) => {
                            self.swap_session(client);
                            disconnected_since = None;
                            info!(generation = self.session().generation, "NATS connection replaced");
                        }
                        Err(_) if *shutdown.borrow() => break,
                        Err(e) => {
                            error!(error = %e, "NATS reconnection failed, will retry");
                            disconnected_since = Some(Instant::now());
                        }
                    }
                }
            }
        }

        info!("NATS connection supervisor stopped");
    }

    fn register(&self, queue: &str, max_retries: Option<u32>) {
        let mut topology = self.topology.write().unwrap_or_else(PoisonError::into_inner);
        let entry = topology
            .entry(queue.to_string())
            .or_insert_with(|| DeclaredQueue {
                stream: stream_name(queue),
                max_retries: None,
            });
        if max_retries.is_some() {
            entry.max_retries = max_retries;
        }
    }

    fn declared(&self, queue: &str) -> Option<DeclaredQueue> {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }

    async fn declare_stream(&self, queue: &str) -> Result<(), TransportError> {
        let stream = stream_name(queue);
        let config = StreamConfig {
            name: stream.clone(),
            subjects: vec![queue.to_string()],
            retention: RetentionPolicy::WorkQueue,
            storage: StorageType::File,
            num_replicas: self.config.stream_replicas,
            ..Default::default()
        };

        match self.session().jetstream.create_stream(config).await {
            Ok(_) => {
                debug!(queue, stream = %stream, "Queue declared");
                Ok(())
            }
            Err(e) if is_topology_conflict(&e.to_string()) => {
                warn!(
                    queue,
                    stream = %stream,
                    error = %e,
                    "Queue already exists with different arguments, keeping existing declaration"
                );
                self.reopen_channel();
                Ok(())
            }
            Err(e) => Err(TransportError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn open_messages(
        &self,
        queue: &str,
        tag: &str,
        prefetch: u16,
        max_retries: u32,
    ) -> Result<PullMessages, TransportError> {
        let consume_error = |message: String| TransportError::Consume {
            queue: queue.to_string(),
            message,
        };

        let stream_name = self
            .declared(queue)
            .map(|declared| declared.stream)
            .unwrap_or_else(|| stream_name(queue));
        let stream = self
            .session()
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| consume_error(e.to_string()))?;

        let durable = durable_name(tag);
        let config = PullConsumerConfig {
            durable_name: Some(durable.clone()),
            filter_subject: queue.to_string(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.config.ack_wait,
            max_ack_pending: i64::from(prefetch.max(1)),
            // Backstop only; the transport dead-letters one delivery earlier
            max_deliver: i64::from(max_retries) + 2,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&durable, config)
            .await
            .map_err(|e| consume_error(e.to_string()))?;

        consumer
            .messages()
            .await
            .map_err(|e| consume_error(e.to_string()))
    }

    /// Consume until the stream ends or shutdown; `true` means shutdown
    async fn drain(
        &self,
        queue: &str,
        mut messages: PullMessages,
        consumer: &Arc<dyn MessageConsumer>,
        max_retries: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
                next = messages.next() => match next {
                    Some(Ok(message)) => {
                        if let Err(e) = self.handle_message(queue, message, consumer, max_retries).await {
                            warn!(queue, error = %e, "Failed to settle delivery, broker will redeliver");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(queue, error = %e, "Consumer stream error");
                        return false;
                    }
                    None => {
                        warn!(queue, "Consumer stream ended");
                        return false;
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        queue: &str,
        message: Message,
        consumer: &Arc<dyn MessageConsumer>,
        max_retries: u32,
    ) -> Result<(), TransportError> {
        let prior_attempts = message
            .info()
            .map(|info| u32::try_from(info.delivered.saturating_sub(1)).unwrap_or(0))
            .unwrap_or(0);

        let delivery = Delivery {
            queue: queue.to_string(),
            body: message.payload.to_vec(),
            headers: message
                .headers
                .as_ref()
                .map(header_map_to_hash)
                .unwrap_or_default(),
            prior_attempts,
        };

        let outcome = consumer.process(&delivery).await;
        let ack_error = |e: async_nats::Error| TransportError::Ack(e.to_string());

        match AckDecision::evaluate(&outcome, prior_attempts, max_retries) {
            AckDecision::Ack => {
                debug!(queue, prior_attempts, "Delivery processed");
                message.ack().await.map_err(ack_error)
            }
            AckDecision::Requeue => {
                debug!(
                    queue,
                    prior_attempts,
                    error = %failure_reason(&outcome),
                    "Delivery failed, requeueing"
                );
                message.ack_with(AckKind::Nak(None)).await.map_err(ack_error)
            }
            AckDecision::DeadLetter => {
                let reason = failure_reason(&outcome);
                if let Err(e) = self
                    .dead_letter(queue, &message, prior_attempts, &reason)
                    .await
                {
                    error!(queue, error = %e, "Dead-letter publish failed, requeueing");
                    return message.ack_with(AckKind::Nak(None)).await.map_err(ack_error);
                }
                warn!(queue, prior_attempts, error = %reason, "Delivery dead-lettered");
                message.ack_with(AckKind::Term).await.map_err(ack_error)
            }
        }
    }

    async fn dead_letter(
        &self,
        queue: &str,
        message: &Message,
        prior_attempts: u32,
        reason: &str,
    ) -> Result<(), TransportError> {
        let dlq = dlq_name(queue);
        let publish_error = |message: String| TransportError::Publish {
            queue: dlq.clone(),
            message,
        };

        let mut headers = message.headers.clone().unwrap_or_default();
        for (name, value) in dead_letter_headers(queue, prior_attempts, reason) {
            headers.insert(name, value.as_str());
        }

        self.session()
            .jetstream
            .publish_with_headers(dlq.clone(), headers, message.payload.clone())
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for NatsQueueTransport {
    #[instrument(skip(self))]
    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        self.declare_stream(name).await?;
        self.register(name, None);
        info!(queue = name, "Queue ready");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn declare_queue_with_dlq(
        &self,
        name: &str,
        max_retries: u32,
    ) -> Result<(), TransportError> {
        let dlq = dlq_name(name);
        self.declare_stream(&dlq).await?;
        self.register(&dlq, None);
        self.declare_stream(name).await?;
        self.register(name, Some(max_retries));
        info!(queue = name, dlq = %dlq, max_retries, "Queue with dead-letter queue ready");
        Ok(())
    }

    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let publish_error = |message: String| TransportError::Publish {
            queue: queue.to_string(),
            message,
        };

        self.session()
            .jetstream
            .publish(queue.to_string(), Bytes::copy_from_slice(body))
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        debug!(queue, "Published");
        Ok(())
    }

    #[instrument(skip(self, consumer, shutdown))]
    async fn start_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn MessageConsumer>,
        prefetch: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let max_retries = self
            .declared(queue)
            .and_then(|declared| declared.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let mut messages = self.open_messages(queue, tag, prefetch, max_retries).await?;
        info!(queue, tag, prefetch, max_retries, "Consumer started");

        loop {
            if self.drain(queue, messages, &consumer, max_retries, &mut shutdown).await {
                break;
            }

            // Stream lost: wait for the supervisor, then resubscribe on the current session
            messages = loop {
                if sleep_or_shutdown(self.config.reconnect_delay, &mut shutdown).await {
                    info!(queue, tag, "Consumer stopped");
                    return Ok(());
                }
                match self.open_messages(queue, tag, prefetch, max_retries).await {
                    Ok(messages) => {
                        info!(queue, tag, "Consumer resubscribed");
                        break messages;
                    }
                    Err(e) => warn!(queue, error = %e, "Resubscribe failed, retrying"),
                }
            };
        }

        info!(queue, tag, "Consumer stopped");
        Ok(())
    }
}

/// JetStream stream name for a queue: `webhooks.raw` -> `WEBHOOKS_RAW`
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn durable_name(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// JetStream rejects re-creating a stream with a different configuration
/// (10058) or with subjects owned by another stream (10065)
fn is_topology_conflict(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("already in use")
        || message.contains("subjects overlap")
        || message.contains("10058")
        || message.contains("10065")
}

fn failure_reason(outcome: &Result<(), ConsumerError>) -> String {
    match outcome {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

fn header_map_to_hash(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, values)| {
            values
                .first()
                .map(|value| (name.to_string(), value.as_str().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_retry_stops_on_shutdown() {
        let config = NatsTransportConfig {
            urls: vec!["nats://127.0.0.1:1".to_string()],
            connection_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_secs(3600),
            max_reconnect_attempts: 5,
            ..NatsTransportConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connecting = tokio::spawn(NatsQueueTransport::connect(config, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .expect("connect loop ignored shutdown")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Connection(ref m)) if m.contains("shutdown")));
    }

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name("webhooks.raw"), "WEBHOOKS_RAW");
        assert_eq!(stream_name("webhooks.raw.dlq"), "WEBHOOKS_RAW_DLQ");
        assert_eq!(
            stream_name("domain.events.message.received"),
            "DOMAIN_EVENTS_MESSAGE_RECEIVED"
        );
    }

    #[test]
    fn test_durable_name() {
        assert_eq!(durable_name("raw-event-processor"), "raw-event-processor");
        assert_eq!(durable_name("parsed.message"), "parsed-message");
    }

    #[test]
    fn test_topology_conflict_detection() {
        assert!(is_topology_conflict(
            "stream name already in use with a different configuration"
        ));
        assert!(is_topology_conflict("subjects overlap with an existing stream"));
        assert!(is_topology_conflict("jetstream error: (code 400, error code 10058)"));
        assert!(!is_topology_conflict("timed out"));
        assert!(!is_topology_conflict("insufficient resources"));
    }

    #[test]
    fn test_failure_reason() {
        assert_eq!(failure_reason(&Ok(())), "");
        assert_eq!(
            failure_reason(&Err(ConsumerError::Parse("bad json".to_string()))),
            "Parse error: bad json"
        );
    }

    #[test]
    fn test_header_map_conversion() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "r-1");
        let converted = header_map_to_hash(&headers);
        assert_eq!(converted.get("x-request-id").map(String::as_str), Some("r-1"));
    }

    #[test]
    fn test_config_from_dto() {
        let dto = NatsConfig {
            urls: vec!["nats://a:4222".to_string(), "nats://b:4222".to_string()],
            max_reconnect_attempts: 3,
            ..NatsConfig::default()
        };
        let config = NatsTransportConfig::from(&dto);
        assert_eq!(config.urls.len(), 2);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, dto.reconnect_delay());
    }
}
