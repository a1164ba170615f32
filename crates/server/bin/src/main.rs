//! Pulso Server
//!
//! Main entry point for the Pulso event backbone.

mod startup;

use std::path::PathBuf;

use clap::Parser;
use pulso_shared::config::{ConfigLoader, LogFormat, LoggingConfig};

/// CLI arguments for pulso-server
#[derive(Parser, Debug)]
#[command(name = "pulso-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pulso event backbone server", long_about = None)]
struct Args {
    /// .env file loaded before reading the environment
    #[arg(long, env = "PULSO_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::new(args.env_file.clone()).load_server_config()?;

    setup_logging(&config.logging, &args)?;

    startup::run(config).await
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn setup_logging(logging: &LoggingConfig, args: &Args) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let level = if args.debug { "debug" } else { logging.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    let installed = if args.json_logs || logging.format == LogFormat::Json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
