//! Agent configuration.

use anyhow::{anyhow, Context, Result};
use graph_deltasync_core::ResolutionStrategy;
use graph_deltasync_engine::EngineConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Local source identifier; generated when unset
    pub source_id: Option<String>,

    /// Replication configuration
    pub replication: ReplicationConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Engine tunables
    pub sync: SyncConfig,
}

/// Replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// MQTT broker URL for delta replication
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Queue store type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

/// Engine tunables exposed through the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Conflict resolution strategy
    pub strategy: ResolutionStrategy,

    /// Retries before dead-lettering
    pub max_retries: u32,

    /// Periodic queue sync interval
    pub sync_interval: Duration,

    /// Batch debounce delay
    pub batch_delay: Duration,

    /// Serialized batch size above which batches are compressed
    pub compression_threshold: usize,

    /// How long a sequence gap may stay open
    pub gap_timeout: Duration,

    /// How long a sent message waits for its acknowledgement
    pub ack_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let engine = EngineConfig::new("");
        Self {
            source_id: None,
            replication: ReplicationConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./deltasync-queue.db"),
            },
            sync: SyncConfig {
                strategy: engine.resolver.strategy,
                max_retries: engine.queue.max_retries,
                sync_interval: engine.queue.sync_interval,
                batch_delay: engine.batcher.batch_delay,
                compression_threshold: engine.batcher.compression_threshold,
                gap_timeout: engine.dedup.gap_timeout,
                ack_timeout: engine.queue.ack_timeout,
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DELTASYNC_SOURCE_ID`: Local source identifier
    /// - `DELTASYNC_MQTT_BROKER`: MQTT broker URL
    /// - `DELTASYNC_TENANT`: Tenant identifier
    /// - `DELTASYNC_STORE_TYPE`: "sqlite" or "memory"
    /// - `DELTASYNC_DB_PATH`: SQLite database path
    /// - `DELTASYNC_CONFLICT_STRATEGY`: lww, fww, merge, ot or manual
    /// - `DELTASYNC_MAX_RETRIES`, `DELTASYNC_SYNC_INTERVAL_MS`,
    ///   `DELTASYNC_BATCH_DELAY_MS`, `DELTASYNC_COMPRESSION_THRESHOLD`,
    ///   `DELTASYNC_GAP_TIMEOUT_MS`, `DELTASYNC_ACK_TIMEOUT_MS`: numeric
    ///   tunables
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("DELTASYNC_SOURCE_ID").filter(|id| !id.is_empty()) {
            config.source_id = Some(id);
        }

        if let Some(mqtt) = lookup("DELTASYNC_MQTT_BROKER") {
            config.replication.mqtt_broker = mqtt;
        }

        if let Some(tenant) = lookup("DELTASYNC_TENANT") {
            config.replication.tenant = tenant;
        }

        if let Some(store_type) = lookup("DELTASYNC_STORE_TYPE") {
            match store_type.as_str() {
                "sqlite" | "memory" => config.persistence.store_type = store_type,
                other => return Err(anyhow!("Invalid DELTASYNC_STORE_TYPE '{other}'")),
            }
        }

        if let Some(db_path) = lookup("DELTASYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(strategy) = lookup("DELTASYNC_CONFLICT_STRATEGY") {
            config.sync.strategy = strategy
                .parse()
                .map_err(|e: String| anyhow!(e))
                .context("Invalid DELTASYNC_CONFLICT_STRATEGY")?;
        }

        if let Some(retries) = parse(&lookup, "DELTASYNC_MAX_RETRIES")? {
            config.sync.max_retries = retries;
        }
        if let Some(ms) = parse(&lookup, "DELTASYNC_SYNC_INTERVAL_MS")? {
            config.sync.sync_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "DELTASYNC_BATCH_DELAY_MS")? {
            config.sync.batch_delay = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse(&lookup, "DELTASYNC_COMPRESSION_THRESHOLD")? {
            config.sync.compression_threshold = bytes;
        }
        if let Some(ms) = parse(&lookup, "DELTASYNC_GAP_TIMEOUT_MS")? {
            config.sync.gap_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "DELTASYNC_ACK_TIMEOUT_MS")? {
            config.sync.ack_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Engine configuration for the given source.
    #[must_use]
    pub fn engine_config(&self, source_id: &str) -> EngineConfig {
        let mut engine = EngineConfig::new(source_id);
        engine.resolver.strategy = self.sync.strategy;
        engine.queue.max_retries = self.sync.max_retries;
        engine.queue.sync_interval = self.sync.sync_interval;
        engine.batcher.batch_delay = self.sync.batch_delay;
        engine.batcher.compression_threshold = self.sync.compression_threshold;
        engine.dedup.gap_timeout = self.sync.gap_timeout;
        engine.queue.ack_timeout = self.sync.ack_timeout;
        engine
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| value.trim().parse::<T>().with_context(|| format!("Invalid {key}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert!(config.source_id.is_none());
        assert_eq!(config.replication.tenant, "default");
        assert_eq!(config.persistence.store_type, "sqlite");
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.strategy, ResolutionStrategy::LastWriterWins);
    }

    #[test]
    fn reads_tunables() {
        let config = load(&[
            ("DELTASYNC_SOURCE_ID", "edge-1"),
            ("DELTASYNC_STORE_TYPE", "memory"),
            ("DELTASYNC_CONFLICT_STRATEGY", "merge"),
            ("DELTASYNC_MAX_RETRIES", "7"),
            ("DELTASYNC_BATCH_DELAY_MS", "20"),
            ("DELTASYNC_GAP_TIMEOUT_MS", "1500"),
            ("DELTASYNC_ACK_TIMEOUT_MS", "2500"),
        ])
        .unwrap();

        assert_eq!(config.source_id.as_deref(), Some("edge-1"));
        assert_eq!(config.persistence.store_type, "memory");

        let engine = config.engine_config("edge-1");
        assert_eq!(engine.source_id, "edge-1");
        assert_eq!(engine.resolver.strategy, ResolutionStrategy::Merge);
        assert_eq!(engine.queue.max_retries, 7);
        assert_eq!(engine.batcher.batch_delay, Duration::from_millis(20));
        assert_eq!(engine.dedup.gap_timeout, Duration::from_millis(1500));
        assert_eq!(engine.queue.ack_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(load(&[("DELTASYNC_MAX_RETRIES", "many")]).is_err());
        assert!(load(&[("DELTASYNC_CONFLICT_STRATEGY", "coin-flip")]).is_err());
        assert!(load(&[("DELTASYNC_STORE_TYPE", "redis")]).is_err());
    }
}
