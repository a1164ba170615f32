//! PostgreSQL connection pool
//!
//! One pool is created by the binary and cloned into every repository.

use std::time::Duration;

use pulso_shared::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::info;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Connection acquisition timeout
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl From<&DatabaseConfig> for DatabasePoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.pool_size,
            min_connections: config.pool_size.min(2),
            connection_timeout: config.connect_timeout(),
            ..Self::default()
        }
    }
}

/// Shared PostgreSQL pool
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    pub async fn new(url: &str, config: DatabasePoolConfig) -> Result<Self, PoolError> {
        info!(
            "Creating PostgreSQL pool (min={}, max={}, timeout={:?})",
            config.min_connections, config.max_connections, config.connection_timeout
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(url)
            .await
            .map_err(|e| PoolError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, PoolError> {
        Self::new(&config.url, DatabasePoolConfig::from(config)).await
    }

    #[inline]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Clone the inner `PgPool`
    #[inline]
    pub fn pg_pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_from_dto() {
        let dto = DatabaseConfig {
            url: "postgres://localhost/pulso".to_string(),
            pool_size: 8,
            connect_timeout_secs: 12,
        };
        let config = DatabasePoolConfig::from(&dto);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.connection_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_tiny_pool_keeps_min_below_max() {
        let dto = DatabaseConfig {
            url: "postgres://localhost/pulso".to_string(),
            pool_size: 1,
            connect_timeout_secs: 5,
        };
        let config = DatabasePoolConfig::from(&dto);
        assert_eq!(config.min_connections, 1);
    }
}
