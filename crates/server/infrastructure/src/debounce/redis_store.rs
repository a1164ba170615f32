//! Redis-backed debounce buffers
//!
//! One list per conversation under `{prefix}{contactID:channelType:channelID}`.
//! Appends push JSON-encoded messages to the tail and re-arm the key TTL in a
//! single MULTI/EXEC, so an abandoned buffer always expires. Flushes trim the
//! handed-off prefix with a Lua script that first checks the head is unchanged.

use std::time::Duration;

use async_trait::async_trait;
use pulso_server_domain::debounce::{BufferedMessage, DebounceError, DebounceStore, SessionKey};
use pulso_shared::config::RedisConfig;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use tracing::{debug, info};

/// Trims the first ARGV[2] entries when the list still starts with message
/// ARGV[1]; returns the remaining length, or -1 when the head changed
const REMOVE_PREFIX_SCRIPT: &str = r#"
local head = redis.call('LINDEX', KEYS[1], 0)
if not head then return -1 end
if cjson.decode(head).message_id ~= ARGV[1] then return -1 end
redis.call('LTRIM', KEYS[1], tonumber(ARGV[2]), -1)
return redis.call('LLEN', KEYS[1])
"#;

#[derive(Clone)]
pub struct RedisDebounceStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisDebounceStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, DebounceError> {
        let client = Client::open(config.url.as_str()).map_err(store_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;
        info!(key_prefix = %config.key_prefix, "Connected to Redis debounce store");
        Ok(Self::new(conn, config.key_prefix.clone()))
    }

    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    fn redis_key(&self, key: &SessionKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl DebounceStore for RedisDebounceStore {
    async fn append(
        &self,
        key: &SessionKey,
        message: &BufferedMessage,
        ttl: Duration,
    ) -> Result<(), DebounceError> {
        let redis_key = self.redis_key(key);
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .rpush(&redis_key, payload)
            .ignore()
            .expire(&redis_key, ttl_seconds(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_error)?;

        debug!(key = %redis_key, message_id = %message.message_id, "Buffered message");
        Ok(())
    }

    async fn read_all(&self, key: &SessionKey) -> Result<Vec<BufferedMessage>, DebounceError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .lrange(self.redis_key(key), 0, -1)
            .await
            .map_err(store_error)?;

        entries
            .iter()
            .map(|entry| serde_json::from_str(entry).map_err(DebounceError::from))
            .collect()
    }

    async fn remove_prefix(
        &self,
        key: &SessionKey,
        expected_head: &str,
        count: usize,
    ) -> Result<Option<usize>, DebounceError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = redis::Script::new(REMOVE_PREFIX_SCRIPT)
            .key(self.redis_key(key))
            .arg(expected_head)
            .arg(count)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(usize::try_from(remaining).ok())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), DebounceError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.redis_key(key))
            .await
            .map_err(store_error)
    }
}

/// Redis TTLs are whole seconds; never arm a zero TTL
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn store_error(e: RedisError) -> DebounceError {
    DebounceError::Store(e.to_string())
}
