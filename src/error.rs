//! Error types for the ShardVault storage engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Write Path
    // =========================================================================
    /// Bucket quota would be exceeded by the requested commit
    #[error("Quota exceeded for bucket {bucket}: {reason}")]
    QuotaExceeded { bucket: String, reason: String },

    /// Shards could not be placed on enough distinct nodes
    #[error("Placement failed for content {content_hash}: {reason}")]
    PlacementFailed {
        content_hash: String,
        reason: String,
    },

    // =========================================================================
    // Read Path
    // =========================================================================
    /// Fewer shards than the code requires were handed to the decoder
    #[error("Insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Fewer shards than the code requires could be read from the nodes
    #[error("Reconstruction impossible: read {available} valid shards, need {required}")]
    ReconstructionImpossible { available: usize, required: usize },

    /// Stored checksum does not match the shard content
    #[error("Corrupt shard {index}: expected checksum {expected:08x}, got {actual:08x}")]
    CorruptShard {
        index: usize,
        expected: u32,
        actual: u32,
    },

    /// A whole read or write operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    // =========================================================================
    // Metadata Ledger
    // =========================================================================
    /// Bucket does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Bucket name already taken
    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    /// Bucket still holds versions
    #[error("Bucket {bucket} is not empty ({versions} versions remain)")]
    BucketNotEmpty { bucket: String, versions: usize },

    /// No latest version for the key
    #[error("Object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// No version with this id under the key
    #[error("Version {version_id} not found for {bucket}/{key}")]
    VersionNotFound {
        bucket: String,
        key: String,
        version_id: String,
    },

    /// Bucket name or object key rejected
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Ledger or content-store invariant broken; never expected in correct operation
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // =========================================================================
    // Content Store
    // =========================================================================
    /// Content entry not present in the dedup index
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    /// Release on an entry whose refcount is already zero
    #[error("Refcount underflow for content {0}")]
    RefcountUnderflow(String),

    // =========================================================================
    // Nodes and Transport
    // =========================================================================
    /// Node id is not in the registry
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node does not hold the requested shard
    #[error("Shard {shard_id} not found on node {node_id}")]
    ShardNotFound { node_id: String, shard_id: String },

    /// A single call to one node exceeded the per-shard timeout
    #[error("Node {node_id} did not answer '{operation}' within {timeout_ms}ms")]
    NodeTimeout {
        node_id: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Node-level I/O failure (connection refused, HTTP error, node down)
    #[error("Transport error on node {node_id}: {reason}")]
    Transport { node_id: String, reason: String },

    /// Shard id contains characters outside the allowed set
    #[error("Invalid shard id: {0}")]
    InvalidShardId(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Erasure Coding
    // =========================================================================
    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// EC reconstruction failed inside the codec
    #[error("EC reconstruction failed: {0}")]
    EcReconstructionFailed(String),

    // =========================================================================
    // Infrastructure
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is local to a single node call.
    ///
    /// The coordinator absorbs these and only escalates when a quorum is lost.
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::ShardNotFound { .. }
                | Error::CorruptShard { .. }
                | Error::NodeTimeout { .. }
                | Error::Http(_)
        )
    }

    /// Whether this error means stored data may be lost or unreachable.
    pub fn is_durability_failure(&self) -> bool {
        matches!(
            self,
            Error::InsufficientShards { .. } | Error::ReconstructionImpossible { .. }
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub(crate) fn node_timeout(
        node_id: impl std::fmt::Display,
        operation: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Error::NodeTimeout {
            node_id: node_id.to_string(),
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub(crate) fn transport(node_id: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Transport {
            node_id: node_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_node_local_classification() {
        assert!(Error::transport("node1", "connection refused").is_node_local());
        assert!(Error::node_timeout("node1", "get_shard", Duration::from_millis(10)).is_node_local());
        // A missed operation deadline is not a per-node failure
        assert!(!Error::timeout("get_any4", Duration::from_secs(15)).is_node_local());
        assert!(!Error::timeout("put_all", Duration::from_secs(30)).is_node_local());
        assert!(Error::ShardNotFound {
            node_id: "node1".into(),
            shard_id: "abc-0".into()
        }
        .is_node_local());
        assert!(!Error::QuotaExceeded {
            bucket: "b1".into(),
            reason: "full".into()
        }
        .is_node_local());
    }

    #[test]
    fn test_durability_classification() {
        assert!(Error::ReconstructionImpossible {
            available: 3,
            required: 4
        }
        .is_durability_failure());
        assert!(!Error::BucketNotFound("b1".into()).is_durability_failure());
    }

    #[test]
    fn test_display() {
        let err = Error::CorruptShard {
            index: 2,
            expected: 0xdeadbeef,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "Corrupt shard 2: expected checksum deadbeef, got 00000001"
        );
    }
}
