//! # Configuration Management
//!
//! Loads node configuration from TOML files. Every tunable of the
//! replication core is enumerated here with a serde default, so a minimal
//! config file only needs the node identity and broker address:
//!
//! ```toml
//! node_id = "node1"
//! topic_prefix = "merkle_kv"
//! storage_path = "data"
//! engine = "sled"
//!
//! [mqtt]
//! broker = "localhost"
//! port = 1883
//! ```
//!
//! `node_id` is the only required field; it is stamped onto every locally
//! originated write and must be unique across the cluster.

use anyhow::Result;
use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for a MerkleKV node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique identity of this node in the cluster. Required.
    pub node_id: String,

    /// MQTT client identifier. Defaults to `node_id` when omitted.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Prefix for all MQTT topics used by this cluster.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Base path for persisted state. The sequence clock lives at
    /// `<storage_path>.seq`, the outbox at `<storage_path>.outbox`, and the
    /// sled engine (when selected) under `<storage_path>/`.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Storage engine type: "memory" or "sled".
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Whether the sequence clock and outbox are persisted to disk. Turning
    /// this off is only sensible for tests and throwaway nodes.
    #[serde(default = "default_true")]
    pub persistence_enabled: bool,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Hostname or IP of the MQTT broker.
    pub broker: String,

    /// Broker port (1883 for plain TCP, 8883 for TLS).
    pub port: u16,

    /// Keep-alive interval for the MQTT session.
    pub keep_alive_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            keep_alive_seconds: 30,
        }
    }
}

/// Request and payload size limits.
///
/// These bound every command before any storage mutation happens and bound
/// the encoded replication event before it reaches the outbox or the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum key length in UTF-8 bytes.
    pub max_key_bytes: usize,

    /// Maximum value length in UTF-8 bytes.
    pub max_value_bytes: usize,

    /// Maximum total JSON payload for a single command, and the cap on the
    /// combined key/value bytes of a bulk operation.
    pub max_bulk_payload_bytes: usize,

    /// Maximum encoded CBOR size of a replication event.
    pub max_cbor_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_bytes: 256,
            max_value_bytes: 262_144,
            max_bulk_payload_bytes: 524_288,
            max_cbor_bytes: 307_200,
        }
    }
}

/// Replication behavior tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Inbound timestamps further in the future than this are clamped to
    /// `now + max_future_skew_ms` before comparison and storage.
    pub max_future_skew_ms: i64,

    /// Minimum wall-clock age before a tombstone may be garbage collected.
    pub tombstone_retention_ms: i64,

    /// How often the tombstone sweeper runs.
    pub sweep_interval_seconds: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_future_skew_ms: 300_000,
            tombstone_retention_ms: 86_400_000,
            sweep_interval_seconds: 3_600,
        }
    }
}

/// Per-peer duplicate suppression bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Width of the per-peer sequence window, in sequence numbers.
    pub window_size: u64,

    /// Peers idle longer than this are pruned by the periodic cleanup.
    pub ttl_seconds: u64,

    /// Maximum number of peer windows kept; least-recently-accessed peers
    /// are evicted beyond this.
    pub max_nodes: usize,

    /// How often idle-peer cleanup runs.
    pub cleanup_interval_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_size: 4096,
            ttl_seconds: 7 * 24 * 3600,
            max_nodes: 1000,
            cleanup_interval_seconds: 3_600,
        }
    }
}

/// Offline event buffering bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Maximum buffered events; the oldest is dropped beyond this.
    pub max_size: usize,

    /// Events published per flush batch before yielding.
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            batch_size: 100,
        }
    }
}

/// Request idempotency cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a cached response stays replayable.
    pub ttl_ms: u64,

    /// Maximum cached responses, LRU-evicted beyond this.
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 600_000,
            max_entries: 1000,
        }
    }
}

/// Client-side request timeout windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub single_key_ms: u64,
    pub multi_key_ms: u64,
    pub sync_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            single_key_ms: 10_000,
            multi_key_ms: 20_000,
            sync_ms: 30_000,
        }
    }
}

fn default_topic_prefix() -> String {
    "merkle_kv".to_string()
}

fn default_storage_path() -> String {
    "data".to_string()
}

fn default_engine() -> String {
    "sled".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.dedup.window_size == 0 || self.dedup.window_size % 64 != 0 {
            anyhow::bail!("dedup.window_size must be a positive multiple of 64");
        }
        if self.outbox.max_size == 0 || self.outbox.batch_size == 0 {
            anyhow::bail!("outbox.max_size and outbox.batch_size must be positive");
        }
        if self.idempotency.max_entries == 0 || self.dedup.max_nodes == 0 {
            anyhow::bail!("cache bounds must be positive");
        }
        Ok(())
    }

    /// The MQTT client identifier, falling back to the node identity.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.node_id)
    }

    /// Topic replication events are fanned out on.
    pub fn replication_topic(&self) -> String {
        format!("{}/replication/events", self.topic_prefix)
    }

    /// Topic a given client sends commands on.
    pub fn command_topic(&self, client_id: &str) -> String {
        format!("{}/{}/cmd", self.topic_prefix, client_id)
    }

    /// Topic a given client receives responses on.
    pub fn response_topic(&self, client_id: &str) -> String {
        format!("{}/{}/res", self.topic_prefix, client_id)
    }

    /// Path of the persisted sequence clock.
    pub fn clock_path(&self) -> String {
        format!("{}.seq", self.storage_path)
    }

    /// Path of the persisted outbox.
    pub fn outbox_path(&self) -> String {
        format!("{}.outbox", self.storage_path)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup.ttl_seconds)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency.ttl_ms)
    }

    /// Configuration with development defaults: localhost broker, sled
    /// engine under "data", replication tunables at their standard defaults.
    pub fn default_for(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            client_id: None,
            topic_prefix: default_topic_prefix(),
            storage_path: default_storage_path(),
            engine: default_engine(),
            persistence_enabled: true,
            mqtt: MqttConfig::default(),
            limits: LimitsConfig::default(),
            replication: ReplicationConfig::default(),
            dedup: DedupConfig::default(),
            outbox: OutboxConfig::default(),
            idempotency: IdempotencyConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}
