//! Engine Configuration
//!
//! Tunables for the coordinator, garbage collector and health monitor, the
//! default bucket quota, and the storage node list. Loaded from an optional
//! YAML file; every field has a default so a partial file is valid.
//!
//! ```yaml
//! coordinator:
//!   shard_timeout_ms: 2000
//! gc:
//!   interval_secs: 600
//! nodes:
//!   - id: node1
//!     base_url: http://localhost:9001
//!     region: us-east
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::{Node, Quota};
use crate::error::{Error, Result};

// =============================================================================
// Sections
// =============================================================================

/// Shard I/O coordinator timeouts and retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bound on a single shard put/get/delete
    pub shard_timeout_ms: u64,
    /// Bound on a whole getAny4
    pub read_deadline_ms: u64,
    /// Bound on a whole putAll, retries included
    pub write_deadline_ms: u64,
    /// Extra placement rounds for shards whose first write failed
    pub max_placement_retries: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard_timeout_ms: 5_000,
            read_deadline_ms: 15_000,
            write_deadline_ms: 30_000,
            max_placement_retries: 2,
        }
    }
}

impl CoordinatorConfig {
    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

/// Garbage collector schedule and retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_secs: u64,
    /// Run the orphan sweep on every Nth scheduled run (0 disables it)
    pub orphan_sweep_every: u64,
    /// Noncurrent versions kept per key (0 keeps none)
    pub max_noncurrent_versions: usize,
    /// Age after which a noncurrent version expires (0 disables age expiry)
    pub noncurrent_retention_days: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            orphan_sweep_every: 6,
            max_noncurrent_versions: 5,
            noncurrent_retention_days: 30,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Health monitor probe schedule and classification threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Probe latency above which an answering node counts as degraded
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_ms: 5_000,
            degraded_latency_ms: 500,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
}

/// Static node entry from the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl From<NodeConfig> for Node {
    fn from(cfg: NodeConfig) -> Self {
        let node = Node::new(cfg.id, cfg.base_url);
        match cfg.region {
            Some(region) => node.with_region(region),
            None => node,
        }
    }
}

// =============================================================================
// Engine Config
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub coordinator: CoordinatorConfig,
    pub gc: GcConfig,
    pub health: HealthConfig,
    /// Quota applied to buckets created without an explicit one
    pub default_quota: Quota,
    /// Capacity of the fire-and-forget event queue
    pub event_queue_capacity: usize,
    pub nodes: Vec<NodeConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            gc: GcConfig::default(),
            health: HealthConfig::default(),
            default_quota: Quota::default(),
            event_queue_capacity: 1024,
            nodes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.shard_timeout_ms == 0 {
            return Err(Error::Config("coordinator.shard_timeout_ms must be > 0".into()));
        }
        if self.coordinator.read_deadline_ms < self.coordinator.shard_timeout_ms {
            return Err(Error::Config(
                "coordinator.read_deadline_ms must be >= shard_timeout_ms".into(),
            ));
        }
        if self.coordinator.write_deadline_ms < self.coordinator.shard_timeout_ms {
            return Err(Error::Config(
                "coordinator.write_deadline_ms must be >= shard_timeout_ms".into(),
            ));
        }
        if self.gc.interval_secs == 0 {
            return Err(Error::Config("gc.interval_secs must be > 0".into()));
        }
        if self.health.interval_secs == 0 {
            return Err(Error::Config("health.interval_secs must be > 0".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::Config("event_queue_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Nodes declared in the file.
    pub fn configured_nodes(&self) -> Vec<Node> {
        self.nodes.iter().cloned().map(Node::from).collect()
    }
}

// =============================================================================
// STORAGE_NODES
// =============================================================================

/// Parse `id[@region]:base_url` entries separated by commas.
///
/// The first colon splits id from URL, so `node1:http://host:9001` works.
pub fn parse_storage_nodes(list: &str) -> Result<Vec<Node>> {
    let mut nodes: Vec<Node> = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (ident, url) = entry
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("node entry '{}' lacks ':'", entry)))?;

        let (id, region) = match ident.split_once('@') {
            Some((id, region)) => (id.trim(), Some(region.trim())),
            None => (ident.trim(), None),
        };
        let url = url.trim();

        if id.is_empty() {
            return Err(Error::Config(format!("node entry '{}' has empty id", entry)));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "node {} url '{}' must start with http:// or https://",
                id, url
            )));
        }
        if nodes.iter().any(|n| n.id.as_str() == id) {
            return Err(Error::Config(format!("duplicate node id {}", id)));
        }

        let mut node = Node::new(id, url);
        if let Some(region) = region.filter(|r| !r.is_empty()) {
            node = node.with_region(region);
        }
        nodes.push(node);
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.coordinator.shard_timeout(), Duration::from_secs(5));
        assert_eq!(config.coordinator.max_placement_retries, 2);
        assert_eq!(config.gc.interval(), Duration::from_secs(3600));
        assert_eq!(config.gc.orphan_sweep_every, 6);
        assert_eq!(config.health.degraded_latency(), Duration::from_millis(500));
        assert_eq!(config.default_quota.max_objects, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
coordinator:
  shard_timeout_ms: 2000
gc:
  max_noncurrent_versions: 2
default_quota:
  max_size_bytes: 1000
  max_objects: 10
nodes:
  - id: node1
    base_url: http://localhost:9001
    region: us-east
  - id: node2
    base_url: http://localhost:9002
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.coordinator.shard_timeout_ms, 2000);
        assert_eq!(config.coordinator.read_deadline_ms, 15_000);
        assert_eq!(config.gc.max_noncurrent_versions, 2);
        assert_eq!(config.gc.interval_secs, 3600);
        assert_eq!(config.default_quota, Quota::new(1000, 10));

        let nodes = config.configured_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].region.as_deref(), Some("us-east"));
        assert_eq!(nodes[1].region, None);
    }

    #[test]
    fn test_validate_rejects_bad_deadlines() {
        let mut config = EngineConfig::default();
        config.coordinator.read_deadline_ms = 10;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_parse_storage_nodes() {
        let nodes = parse_storage_nodes(
            "node1:http://localhost:9001, node2@eu-west:http://10.0.0.2:9002,",
        )
        .unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id.as_str(), "node1");
        assert_eq!(nodes[0].base_url, "http://localhost:9001");
        assert_eq!(nodes[1].region.as_deref(), Some("eu-west"));
        assert_eq!(nodes[1].base_url, "http://10.0.0.2:9002");
    }

    #[test]
    fn test_parse_storage_nodes_errors() {
        assert!(parse_storage_nodes("node1").is_err());
        assert!(parse_storage_nodes(":http://x").is_err());
        assert!(parse_storage_nodes("node1:ftp://x").is_err());
        assert!(parse_storage_nodes("n:http://a,n:http://b").is_err());
        assert!(parse_storage_nodes("").unwrap().is_empty());
    }
}
