//! Configuration module for the Pulso event backbone
//!
//! Centralized configuration loading, validation, and Data Transfer Objects
//! (DTOs) for every component of the server.
//!
//! # Architecture
//!
//! 1. **Single Source of Truth**: configuration is loaded once at startup
//! 2. **Fail Fast**: missing or malformed values are reported immediately
//! 3. **DTO Pattern**: configuration is immutable and passed via dependency injection
//!
//! # Usage
//!
//! ```ignore
//! use pulso_shared::config::ConfigLoader;
//! use std::path::PathBuf;
//!
//! let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
//! let config = loader.load_server_config()?;
//! println!("Outbox channel: {}", config.outbox.notify_channel);
//! ```
//!
//! # Environment Variables
//!
//! ## Required Variables
//!
//! - `PULSO_DATABASE_URL`: PostgreSQL connection string
//! - `PULSO_NATS_URL`: NATS connection URL(s), comma-separated
//! - `PULSO_REDIS_URL`: Redis connection URL for the debounce buffers
//!
//! ## Optional Variables
//!
//! See the `from_env` constructors in [`loader`] for defaults.

pub mod dto;
pub mod error;
pub mod loader;
pub mod validator;

pub use dto::{
    DatabaseConfig, DebounceConfig, DebounceStrategy, LogFormat, LoggingConfig, NatsConfig,
    OutboxConfig, RedisConfig, ServerConfigDto,
};
pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use validator::{
    validate_database_url, validate_nats_urls, validate_redis_url, validate_server_config,
};
