use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::broker::WorkerGroup;

/// Top-level runq configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunqConfig {
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub sweeper: SweeperConfig,
    pub admission: AdmissionConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

/// Lease and selection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Lease length granted on dequeue.
    pub visibility_timeout_ms: u64,
    /// Heartbeats never extend a lease past `lease start + this`.
    pub max_visibility_timeout_ms: u64,
    /// Limit for queues with none configured. Absent means unlimited.
    pub default_concurrency_limit: Option<u32>,
    /// How many due queues are read from a parent index per dequeue.
    pub parent_queue_selection_limit: usize,
}

/// Visibility sweeper settings. `workers = 0` disables background sweeping.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub workers: usize,
    pub interval_ms: u64,
    pub batch_size: usize,
}

/// Worker loop run by the server. Setting both IDs makes the worker pull from
/// that environment's own parent index instead of the shared one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
    /// Idle wait between dequeue attempts once nothing is eligible.
    pub poll_interval_ms: u64,
    pub organization_id: Option<String>,
    pub environment_id: Option<String>,
}

impl WorkerConfig {
    pub fn worker_group(&self) -> WorkerGroup {
        match (&self.organization_id, &self.environment_id) {
            (Some(organization_id), Some(environment_id)) => WorkerGroup::Unmanaged {
                organization_id: organization_id.clone(),
                environment_id: environment_id.clone(),
            },
            _ => WorkerGroup::Managed,
        }
    }
}

/// Producer-side admission settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Per-queue depth cap in development environments. Absent means unbounded.
    pub max_queue_depth_development: Option<u64>,
    /// Per-queue depth cap in every other environment kind.
    pub max_queue_depth_deployed: Option<u64>,
    /// Organization-specific caps, keyed by organization ID.
    pub organization_max_queue_depth: HashMap<String, DepthLimits>,
    pub depth_cache_ttl_ms: u64,
    /// Charge environment-level holding for every waiting parent that keeps
    /// its queue slot, not only for parents on unlimited queues.
    pub legacy_environment_accounting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DepthLimits {
    pub development: Option<u64>,
    pub deployed: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("runq-data"),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
            max_visibility_timeout_ms: 900_000,
            default_concurrency_limit: None,
            parent_queue_selection_limit: 50,
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            interval_ms: 1_000,
            batch_size: 100,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            poll_interval_ms: 500,
            organization_id: None,
            environment_id: None,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_depth_development: None,
            max_queue_depth_deployed: None,
            organization_max_queue_depth: HashMap::new(),
            depth_cache_ttl_ms: 5_000,
            legacy_environment_accounting: false,
        }
    }
}
