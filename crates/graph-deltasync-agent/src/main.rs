//! # Graph-ΔSync Agent
//!
//! Synchronization agent for offline-first graph replication.
//!
//! ## Architecture
//!
//! The agent runs four concurrent loops:
//! 1. **Ingress**: Reads local deltas from stdin
//! 2. **Engine**: Applies, batches and reconciles deltas
//! 3. **Replication**: Publishes and receives wire messages over MQTT
//! 4. **Queue**: Drains the durable offline queue while the broker is reachable

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod persistence;
mod replication;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries applied deltas
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Graph-ΔSync Agent"
    );

    let config = AgentConfig::from_env()?;
    let source_id = config
        .source_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    tracing::info!(%source_id, strategy = ?config.sync.strategy, "Agent initialized");

    let agent = Agent::new(config, source_id)?;
    agent.run().await?;

    Ok(())
}
