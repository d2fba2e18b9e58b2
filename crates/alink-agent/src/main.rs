//! # Alink Agent
//!
//! Gateway process for the Alink device protocol.
//!
//! ## Architecture
//!
//! The agent runs three concurrent pieces:
//! 1. **Delivery**: polls the MQTT event loop and dispatches every message
//! 2. **Sweeper**: evicts pending requests nobody waits for any more
//! 3. **Lifecycle**: connects configured sub-devices and logs platform pushes

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Alink Agent");

    let config = AgentConfig::from_env()?;
    tracing::info!(
        gateway = %config.root.key(),
        sub_devices = config.sub_devices.len(),
        "Configuration loaded"
    );

    Agent::new(config).run().await
}
