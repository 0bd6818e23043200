//! # EWS Bridge Agent
//!
//! Connector runtime that pushes EWS point values to an MQTT broker.
//!
//! ## Architecture
//!
//! Every cycle runs one pipeline, strictly in order:
//! 1. **Reconcile**: Re-read existing EWS subscriptions, repairing renamed ones
//!    and evicting dead ones
//! 2. **Subscribe**: Create subscriptions, 500 points at a time, for points
//!    nothing covers yet
//! 3. **Aggregate**: Merge change events with due heartbeats into one message
//!    per device
//! 4. **Publish**: Push each message, retained, to the value push topic
//! 5. **Persist**: Save subscription bookkeeping and signal state to the cache

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod persistence;
mod publisher;
mod reconciler;
mod runtime;
mod shutdown;
mod subscriptions;
mod transport;

pub use config::ConnectorConfig;
pub use runtime::Connector;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting EWS Bridge Agent"
    );

    let config = ConnectorConfig::from_env()?;
    let interval = config.cycle_interval;

    let connector = Connector::from_config(&config)?;

    connector.run(interval).await?;

    Ok(())
}
