//! Tidemail - Mail server entry point

mod supervisor;

use anyhow::Result;
use tidemail_common::config::{Config, LoggingConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::path(Config::dev_mode_from_args());
    let config = Config::load_or_default(&config_path)?;

    init_logging(&config.logging);
    info!(config = %config_path.display(), "Starting Tidemail mail server...");

    Supervisor::new(config_path).run().await
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tidemail=debug", logging.level)));
    let json = logging.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true).with_level(true)))
        .init();
}
