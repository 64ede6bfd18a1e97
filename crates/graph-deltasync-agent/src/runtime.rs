//! Agent runtime orchestration.

use crate::config::AgentConfig;
use crate::persistence::SqliteQueueStore;
use crate::replication::MqttTransport;
use anyhow::{Context, Result};
use graph_deltasync_core::GraphDelta;
use graph_deltasync_engine::{
    LocalUpdate, MemoryQueueStore, OfflineQueueManager, OperationPriorities, QueueStore, SyncEngine, Transport,
};
use graph_deltasync_proto::{ChannelScheme, WireMessage};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

/// Capacity of the inbound and local channels.
const CHANNEL_CAPACITY: usize = 1024;

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    source_id: String,
    store: Arc<dyn QueueStore>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig, source_id: String) -> Result<Self> {
        let store: Arc<dyn QueueStore> = if config.persistence.store_type == "sqlite" {
            Arc::new(
                SqliteQueueStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            )
        } else {
            Arc::new(MemoryQueueStore::new())
        };

        Ok(Self {
            config,
            source_id,
            store,
        })
    }

    /// Run the agent until Ctrl+C.
    ///
    /// Local deltas are read from stdin, one JSON delta per line; applied
    /// deltas are written to stdout the same way.
    ///
    /// # Errors
    ///
    /// Returns error if any component fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!(source_id = %self.source_id, "Starting agent runtime");

        let scheme = ChannelScheme::new(&self.config.replication.tenant);
        let (transport, eventloop) = MqttTransport::new(
            &self.config.replication.mqtt_broker,
            &format!("graph-deltasync-{}", self.source_id),
            scheme,
        )
        .context("Failed to create MQTT transport")?;
        let connectivity = transport.connectivity();
        tokio::spawn(Arc::clone(&transport).pump(eventloop));
        transport.subscribe_tenant().await?;

        let (inbound_tx, inbound_rx) = mpsc::channel::<WireMessage>(CHANNEL_CAPACITY);
        let _subscription = transport.subscribe(Arc::new(move |message: WireMessage| {
            if let Err(e) = inbound_tx.try_send(message) {
                tracing::warn!(error = %e, "Inbound channel full, dropping message");
            }
        }));

        let (local_tx, local_rx) = mpsc::channel::<LocalUpdate>(CHANNEL_CAPACITY);
        tokio::spawn(read_local_deltas(local_tx));

        let engine = SyncEngine::new(
            self.config.engine_config(&self.source_id),
            Arc::clone(&self.store),
            transport,
            print_delta,
        );
        tokio::spawn(follow_connectivity(connectivity, Arc::clone(engine.queue())));

        tracing::info!("Agent running, press Ctrl+C to stop");

        engine
            .run(inbound_rx, local_rx, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("Agent stopped");
        Ok(())
    }
}

/// Mirror broker connectivity into the offline queue.
async fn follow_connectivity(mut connectivity: watch::Receiver<bool>, queue: Arc<OfflineQueueManager>) {
    loop {
        let online = *connectivity.borrow_and_update();
        queue.set_online(online);
        if connectivity.changed().await.is_err() {
            break;
        }
    }
}

async fn read_local_deltas(local: mpsc::Sender<LocalUpdate>) {
    let priorities = OperationPriorities::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let delta = match GraphDelta::from_json(&line) {
            Ok(delta) => delta,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed local delta");
                continue;
            }
        };
        let priority = delta
            .operations
            .iter()
            .map(|op| priorities.of(op.kind))
            .max()
            .unwrap_or(0);

        if local.send(LocalUpdate { delta, priority }).await.is_err() {
            break;
        }
    }
    tracing::debug!("Local input closed");
}

fn print_delta(delta: &GraphDelta) {
    match delta.to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(delta_id = %delta.id, error = %e, "Failed to encode applied delta"),
    }
}
