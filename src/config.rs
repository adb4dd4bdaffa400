//! Node and cluster configuration.
//!
//! Loaded from TOML, with a handful of environment overrides applied on top.
//! Durations are encoded as integer milliseconds.

use crate::error::{Error, Result};
use crate::streaming::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// TigerStyle: Explicit limits with _MAX suffix
const SHARD_COUNT_MAX: u32 = 4096;
const CLUSTER_SIZE_MAX: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace for coordination keys and object-store keys
    pub cluster_name: String,
    /// Coordination service endpoints; empty runs an in-process coordinator
    pub cluster_manager_addresses: Vec<String>,
    /// Admin/cluster listener address of every node, indexed by node id
    pub cluster_addresses: Vec<String>,
    /// This node's id (index into `cluster_addresses`)
    pub node_id: u32,
    /// Client-facing address per node, advertised in the node descriptor
    pub api_addresses: Vec<String>,
    /// Take shard leadership and accept ingestion
    pub processing_enabled: bool,
    /// Run manifest-version retention on led shards
    pub level_manager_enabled: bool,
    pub shard_count: u32,
    /// Lower bound between timer-driven flushes of one shard
    #[serde(with = "duration_millis")]
    pub min_snapshot_interval: Duration,
    /// Maximum age of a write buffer before it is flushed
    #[serde(with = "duration_millis")]
    pub memtable_max_replace_interval: Duration,
    /// Buffered bytes that trigger an immediate flush
    pub memtable_max_size_bytes: usize,
    /// Cluster-state refresh interval (staleness bound)
    #[serde(with = "duration_millis")]
    pub cluster_state_update_interval: Duration,
    /// Backoff base for manifest and object-store retries
    #[serde(with = "duration_millis")]
    pub level_manager_retry_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_retry_delay: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,
    /// Grace window for in-flight queries during a graceful shutdown
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
    /// Per-node, per-phase bound for whole-cluster shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_phase_timeout: Duration,
    /// Bound for the stop step; a quiesced node that is not told to stop
    /// within this window stops on its own
    #[serde(with = "duration_millis")]
    pub shutdown_stop_timeout: Duration,
    /// Manifest versions kept per shard by retention
    pub manifest_retained_versions: usize,
    pub object_store: ObjectStoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_name: "streamvault".to_string(),
            cluster_manager_addresses: Vec::new(),
            cluster_addresses: Vec::new(),
            node_id: 0,
            api_addresses: Vec::new(),
            processing_enabled: true,
            level_manager_enabled: true,
            shard_count: 16,
            min_snapshot_interval: Duration::from_millis(100),
            memtable_max_replace_interval: Duration::from_secs(1),
            memtable_max_size_bytes: 4 * 1024 * 1024, // 4MB
            cluster_state_update_interval: Duration::from_secs(1),
            level_manager_retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(5),
            max_retries: 5,
            lease_ttl: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            shutdown_phase_timeout: Duration::from_secs(30),
            shutdown_stop_timeout: Duration::from_secs(120),
            manifest_retained_versions: 16,
            object_store: ObjectStoreConfig::default(),
        }
    }
}

impl Config {
    /// Configuration for tests: fast refresh and retry, small buffers.
    pub fn test(cluster_name: &str, node_id: u32, cluster_size: usize) -> Self {
        Config {
            cluster_name: cluster_name.to_string(),
            cluster_addresses: vec!["127.0.0.1:0".to_string(); cluster_size],
            node_id,
            shard_count: 10,
            min_snapshot_interval: Duration::from_millis(100),
            memtable_max_replace_interval: Duration::from_secs(1),
            memtable_max_size_bytes: 64 * 1024, // 64KB
            cluster_state_update_interval: Duration::from_millis(10),
            level_manager_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
            max_retries: 4,
            lease_ttl: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            shutdown_phase_timeout: Duration::from_secs(10),
            shutdown_stop_timeout: Duration::from_secs(10),
            manifest_retained_versions: 8,
            ..Config::default()
        }
    }

    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Environment overrides for container deployments.
    pub fn apply_env(&mut self) {
        if let Some(id) = std::env::var("STREAMVAULT_NODE_ID")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.node_id = id;
        }
        if let Ok(name) = std::env::var("STREAMVAULT_CLUSTER_NAME") {
            self.cluster_name = name;
        }
        if let Ok(path) = std::env::var("STREAMVAULT_OBJECT_STORE_PATH") {
            self.object_store.kind = ObjectStoreKind::LocalFs;
            self.object_store.path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() || self.cluster_name.contains('/') {
            return Err(Error::Config(format!(
                "cluster_name {:?} must be non-empty and contain no '/'",
                self.cluster_name
            )));
        }
        if self.shard_count == 0 || self.shard_count > SHARD_COUNT_MAX {
            return Err(Error::Config(format!(
                "shard_count {} outside 1..={}",
                self.shard_count, SHARD_COUNT_MAX
            )));
        }
        if self.cluster_addresses.len() > CLUSTER_SIZE_MAX {
            return Err(Error::Config(format!(
                "{} cluster addresses exceed max {}",
                self.cluster_addresses.len(),
                CLUSTER_SIZE_MAX
            )));
        }
        if !self.cluster_addresses.is_empty()
            && self.node_id as usize >= self.cluster_addresses.len()
        {
            return Err(Error::Config(format!(
                "node_id {} has no entry in cluster_addresses ({} entries)",
                self.node_id,
                self.cluster_addresses.len()
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        let intervals = [
            ("min_snapshot_interval", self.min_snapshot_interval),
            ("memtable_max_replace_interval", self.memtable_max_replace_interval),
            ("cluster_state_update_interval", self.cluster_state_update_interval),
            ("level_manager_retry_delay", self.level_manager_retry_delay),
            ("lease_ttl", self.lease_ttl),
            ("shutdown_stop_timeout", self.shutdown_stop_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.lease_ttl <= self.cluster_state_update_interval {
            return Err(Error::Config(
                "lease_ttl must exceed cluster_state_update_interval".to_string(),
            ));
        }
        if self.object_store.kind == ObjectStoreKind::LocalFs && self.object_store.path.is_none() {
            return Err(Error::Config("localfs object store needs a path".to_string()));
        }
        Ok(())
    }

    /// Backoff policy shared by manifest, object-store and coordination retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.level_manager_retry_delay,
            max_delay: self.max_retry_delay.max(self.level_manager_retry_delay),
            max_attempts: self.max_retries,
        }
    }

    /// This node's admin listener address, if the cluster layout names one.
    pub fn cluster_address(&self) -> Option<&str> {
        self.cluster_addresses
            .get(self.node_id as usize)
            .map(String::as_str)
    }

    pub fn api_address(&self) -> Option<&str> {
        self.api_addresses.get(self.node_id as usize).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreKind {
    /// Process-local store (tests and single-process clusters)
    #[default]
    Memory,
    LocalFs,
    /// Amazon S3 or compatible
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObjectStoreConfig {
    #[serde(rename = "type")]
    pub kind: ObjectStoreKind,
    /// Root directory for the local filesystem store
    pub path: Option<PathBuf>,
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix within bucket
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
