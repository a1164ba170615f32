//! Configuration loader
//!
//! Provides the [`ConfigLoader`], responsible for loading configuration from
//! an optional .env file and the process environment.

use std::path::{Path, PathBuf};

use super::dto::{
    DatabaseConfig, DebounceConfig, DebounceStrategy, LogFormat, LoggingConfig, NatsConfig,
    OutboxConfig, RedisConfig, ServerConfigDto,
};
use super::error::{ConfigError, Result};
use super::validator::validate_server_config;

/// Variable lookup used by the `from_env` constructors
type Vars<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Configuration loader
///
/// Loads configuration from:
/// 1. .env file (optional)
/// 2. Environment variables
///
/// # Example
///
/// ```ignore
/// use pulso_shared::config::ConfigLoader;
/// use std::path::PathBuf;
///
/// let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
/// let config = loader.load_server_config()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Optional path to .env file
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    ///
    /// # Arguments
    ///
    /// * `env_file_path` - Optional path to .env file. If provided, the file
    ///                     will be loaded before reading environment variables.
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load and validate the server configuration
    ///
    /// # Returns
    ///
    /// `Ok(ServerConfigDto)` if configuration is valid and complete
    /// `Err(ConfigError)` if required configuration is missing or invalid
    pub fn load_server_config(&self) -> Result<ServerConfigDto> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let config = ServerConfigDto::from_env()?;
        validate_server_config(&config)?;

        Ok(config)
    }

    fn load_env_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ConfigError::EnvFileLoad {
                path: path.to_path_buf(),
                source: dotenv::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path.display()),
                )),
            });
        }

        dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

// ============================================================================
// Implementation: ServerConfigDto::from_env
// ============================================================================

impl ServerConfigDto {
    /// Build server configuration from environment variables
    ///
    /// # Required Environment Variables
    ///
    /// - `PULSO_DATABASE_URL`
    /// - `PULSO_NATS_URL`
    /// - `PULSO_REDIS_URL`
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_vars(vars)?,
            nats: NatsConfig::from_vars(vars)?,
            redis: RedisConfig::from_vars(vars)?,
            outbox: OutboxConfig::from_vars(vars)?,
            debounce: DebounceConfig::from_vars(vars)?,
            logging: LoggingConfig::from_vars(vars)?,
        })
    }
}

impl DatabaseConfig {
    /// Build database configuration from environment variables
    ///
    /// # Optional Variables
    ///
    /// - `PULSO_DB_POOL_SIZE`: Default 20
    /// - `PULSO_DB_CONNECT_TIMEOUT_SECS`: Default 30
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        Ok(Self {
            url: required_var(vars, "PULSO_DATABASE_URL")?,
            pool_size: parse_optional_var(vars, "PULSO_DB_POOL_SIZE", 20)?,
            connect_timeout_secs: parse_optional_var(vars, "PULSO_DB_CONNECT_TIMEOUT_SECS", 30)?,
        })
    }
}

impl NatsConfig {
    /// Build NATS configuration from environment variables
    ///
    /// # Required Variables
    ///
    /// - `PULSO_NATS_URL`: NATS connection URL (comma-separated for clustering)
    ///
    /// # Optional Variables
    ///
    /// - `PULSO_NATS_TIMEOUT_SECS` (default: 10)
    /// - `PULSO_NATS_RECONNECT_DELAY_MS` (default: 5000)
    /// - `PULSO_NATS_MAX_RECONNECT_ATTEMPTS` (default: 10)
    /// - `PULSO_NATS_STREAM_REPLICAS` (default: 1)
    /// - `PULSO_NATS_PREFETCH` (default: 10)
    /// - `PULSO_NATS_CIRCUIT_BREAKER`: "1"=on, "0"=off (default: 1)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        let urls_str = required_var(vars, "PULSO_NATS_URL")?;
        let urls: Vec<String> = urls_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if urls.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "PULSO_NATS_URL".to_string(),
                value: urls_str,
            });
        }

        let defaults = NatsConfig::default();
        Ok(Self {
            urls,
            timeout_secs: parse_optional_var(vars, "PULSO_NATS_TIMEOUT_SECS", defaults.timeout_secs)?,
            reconnect_delay_ms: parse_optional_var(
                vars,
                "PULSO_NATS_RECONNECT_DELAY_MS",
                defaults.reconnect_delay_ms,
            )?,
            max_reconnect_attempts: parse_optional_var(
                vars,
                "PULSO_NATS_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            stream_replicas: parse_optional_var(
                vars,
                "PULSO_NATS_STREAM_REPLICAS",
                defaults.stream_replicas,
            )?,
            prefetch: parse_optional_var(vars, "PULSO_NATS_PREFETCH", defaults.prefetch)?,
            circuit_breaker_enabled: parse_flag(
                vars,
                "PULSO_NATS_CIRCUIT_BREAKER",
                defaults.circuit_breaker_enabled,
            )?,
        })
    }
}

impl RedisConfig {
    /// # Required Variables
    ///
    /// - `PULSO_REDIS_URL`
    ///
    /// # Optional Variables
    ///
    /// - `PULSO_REDIS_KEY_PREFIX` (default: "debounce")
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        Ok(Self {
            url: required_var(vars, "PULSO_REDIS_URL")?,
            key_prefix: vars("PULSO_REDIS_KEY_PREFIX").unwrap_or_else(|| "debounce".to_string()),
        })
    }
}

impl OutboxConfig {
    /// # Optional Variables
    ///
    /// - `PULSO_OUTBOX_CHANNEL` (default: "outbox_events")
    /// - `PULSO_OUTBOX_POLL_INTERVAL_MS` (default: 5000)
    /// - `PULSO_OUTBOX_BATCH_SIZE` (default: 50)
    /// - `PULSO_OUTBOX_STALE_PROCESSING_SECS` (default: 300)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        let defaults = OutboxConfig::default();
        Ok(Self {
            notify_channel: vars("PULSO_OUTBOX_CHANNEL").unwrap_or(defaults.notify_channel),
            poll_interval_ms: parse_optional_var(
                vars,
                "PULSO_OUTBOX_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            batch_size: parse_optional_var(vars, "PULSO_OUTBOX_BATCH_SIZE", defaults.batch_size)?,
            stale_processing_secs: parse_optional_var(
                vars,
                "PULSO_OUTBOX_STALE_PROCESSING_SECS",
                defaults.stale_processing_secs,
            )?,
        })
    }
}

impl DebounceConfig {
    /// # Optional Variables
    ///
    /// - `PULSO_DEBOUNCE_STRATEGY`: "wait" or "window" (default: "wait")
    /// - `PULSO_DEBOUNCE_WAIT_MS` (default: 3000)
    /// - `PULSO_DEBOUNCE_MAX_RETRIES` (default: 5)
    /// - `PULSO_DEBOUNCE_TTL_SECS` (default: 300)
    /// - `PULSO_DEBOUNCE_WINDOW_MS` (default: 5000)
    /// - `PULSO_DEBOUNCE_MAX_BATCH_SIZE` (default: 10)
    /// - `PULSO_DEBOUNCE_SWEEP_INTERVAL_MS` (default: 1000)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        let defaults = DebounceConfig::default();
        let strategy = match vars("PULSO_DEBOUNCE_STRATEGY") {
            Some(raw) => raw
                .parse::<DebounceStrategy>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: "PULSO_DEBOUNCE_STRATEGY".to_string(),
                    value: raw,
                })?,
            None => defaults.strategy,
        };

        Ok(Self {
            strategy,
            wait_ms: parse_optional_var(vars, "PULSO_DEBOUNCE_WAIT_MS", defaults.wait_ms)?,
            max_retries: parse_optional_var(
                vars,
                "PULSO_DEBOUNCE_MAX_RETRIES",
                defaults.max_retries,
            )?,
            buffer_ttl_secs: parse_optional_var(
                vars,
                "PULSO_DEBOUNCE_TTL_SECS",
                defaults.buffer_ttl_secs,
            )?,
            window_ms: parse_optional_var(vars, "PULSO_DEBOUNCE_WINDOW_MS", defaults.window_ms)?,
            max_batch_size: parse_optional_var(
                vars,
                "PULSO_DEBOUNCE_MAX_BATCH_SIZE",
                defaults.max_batch_size,
            )?,
            sweep_interval_ms: parse_optional_var(
                vars,
                "PULSO_DEBOUNCE_SWEEP_INTERVAL_MS",
                defaults.sweep_interval_ms,
            )?,
        })
    }
}

impl LoggingConfig {
    /// # Optional Variables
    ///
    /// - `RUST_LOG` (default: "info")
    /// - `PULSO_LOG_FORMAT`: "pretty" or "json" (default: "pretty")
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&process_env)
    }

    fn from_vars(vars: Vars<'_>) -> Result<Self> {
        let format = match vars("PULSO_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "PULSO_LOG_FORMAT".to_string(),
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            level: vars("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            format,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn required_var(vars: Vars<'_>, var: &str) -> Result<String> {
    vars(var)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            var: var.to_string(),
        })
}

/// Parse optional variable with default value; a present but malformed value is an error
fn parse_optional_var<T>(vars: Vars<'_>, var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match vars(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
    }
}

fn parse_flag(vars: Vars<'_>, var: &str, default: bool) -> Result<bool> {
    match vars(var).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") => Ok(true),
        Some("0") | Some("false") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: other.to_string(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
