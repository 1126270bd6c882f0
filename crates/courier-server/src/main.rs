//! # Courier Server
//!
//! WebSocket chat room and notification server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Pick up ./courier.toml, /etc/courier/courier.toml or ~/.config/courier/courier.toml
//! # and override single values from the environment
//! COURIER__PORT=9000 COURIER__LIMITS__MAX_CONNECTIONS=500 courier
//! ```

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
