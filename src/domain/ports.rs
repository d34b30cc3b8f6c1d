//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared by the engine components and
//! the abstractions (ports) the engine depends on. Infrastructure adapters
//! implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Storage Engine                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  EcCodec │ ShardTransport │ QuotaManager │ Events   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  ReedSolomon │ Http / InMemory │ BucketQuota │ ... │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

use super::events::DomainEvent;

// =============================================================================
// Code Geometry
// =============================================================================

/// Number of systematic data shards (k)
pub const DATA_SHARDS: usize = 4;

/// Number of parity shards (m)
pub const PARITY_SHARDS: usize = 2;

/// Shards per content entry (k + m)
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;

// =============================================================================
// Identifiers
// =============================================================================

/// Storage node identifier (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of raw object bytes: hex-encoded SHA-256.
///
/// Always computed over the uploaded bytes, never over shard bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw object bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Wrap an already computed hex digest.
    pub fn from_hex(hex_digest: impl Into<String>) -> Result<Self> {
        let digest = hex_digest.into();
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Internal(format!("invalid content hash: {}", digest)));
        }
        Ok(Self(digest.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Opaque key of a shard on a node.
///
/// Restricted to `[A-Za-z0-9._-]` so it is safe as a file name and URL segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId(String);

impl ShardId {
    /// Validate and wrap a shard id.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 200
            && !id.starts_with('.')
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if !valid {
            return Err(Error::InvalidShardId(id));
        }
        Ok(Self(id))
    }

    /// Id for shard `index` of `content_hash` in one placement attempt.
    pub fn for_placement(content_hash: &ContentHash, index: usize, placement_tag: &str) -> Self {
        Self(format!("{}-{}-{}", content_hash.as_str(), index, placement_tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ShardId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<ShardId> for String {
    fn from(id: ShardId) -> Self {
        id.0
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Health status of a storage node, as published by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Up,
    Degraded,
    Down,
}

impl NodeStatus {
    /// Placement preference: lower is better, `None` means never place.
    pub fn placement_rank(&self) -> Option<u8> {
        match self {
            NodeStatus::Up => Some(0),
            NodeStatus::Degraded => Some(1),
            NodeStatus::Down => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Up => write!(f, "up"),
            NodeStatus::Degraded => write!(f, "degraded"),
            NodeStatus::Down => write!(f, "down"),
        }
    }
}

/// A storage node endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub base_url: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_node_status")]
    pub health_status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency: Option<Duration>,
}

fn default_node_status() -> NodeStatus {
    NodeStatus::Up
}

impl Node {
    /// Create a node that is assumed up until the first health probe.
    pub fn new(id: impl Into<NodeId>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            region: None,
            health_status: NodeStatus::Up,
            last_latency: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

// =============================================================================
// Shards
// =============================================================================

/// Whether a shard holds systematic data or parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    Data,
    Parity,
}

impl ShardKind {
    pub fn for_index(index: usize) -> Self {
        if index < DATA_SHARDS {
            ShardKind::Data
        } else {
            ShardKind::Parity
        }
    }
}

/// Shard bytes plus the integrity checksum stored alongside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredShard {
    pub data: Bytes,
    pub checksum: u32,
}

impl StoredShard {
    /// Wrap shard bytes, computing their checksum.
    pub fn seal(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = crc32fast::hash(&data);
        Self { data, checksum }
    }

    /// Check the stored checksum against the content.
    pub fn verify(&self, index: usize) -> Result<()> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.checksum {
            return Err(Error::CorruptShard {
                index,
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Location of one shard of a content entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub shard_index: usize,
    pub kind: ShardKind,
    pub node_id: NodeId,
    pub shard_id: ShardId,
}

/// The six shard locations of a content entry, ordered by shard index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ShardRef>", into = "Vec<ShardRef>")]
pub struct ShardSet(Vec<ShardRef>);

impl ShardSet {
    /// Build a shard set, enforcing one shard per index and per node.
    pub fn new(mut refs: Vec<ShardRef>) -> Result<Self> {
        refs.sort_by_key(|r| r.shard_index);

        if refs.len() != TOTAL_SHARDS {
            return Err(Error::InvariantViolation(format!(
                "shard set must hold {} shards, got {}",
                TOTAL_SHARDS,
                refs.len()
            )));
        }
        for (expected, r) in refs.iter().enumerate() {
            if r.shard_index != expected {
                return Err(Error::InvariantViolation(format!(
                    "shard set has index {} where {} was expected",
                    r.shard_index, expected
                )));
            }
            if r.kind != ShardKind::for_index(expected) {
                return Err(Error::InvariantViolation(format!(
                    "shard {} is marked {:?}",
                    expected, r.kind
                )));
            }
        }
        let mut nodes: Vec<&NodeId> = refs.iter().map(|r| &r.node_id).collect();
        nodes.sort();
        nodes.dedup();
        if nodes.len() != refs.len() {
            return Err(Error::InvariantViolation(
                "two shards of one content entry share a node".to_string(),
            ));
        }

        Ok(Self(refs))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRef> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ShardRef> {
        self.0.get(index)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.0.iter().map(|r| r.node_id.clone()).collect()
    }

    pub fn into_refs(self) -> Vec<ShardRef> {
        self.0
    }
}

impl TryFrom<Vec<ShardRef>> for ShardSet {
    type Error = Error;

    fn try_from(refs: Vec<ShardRef>) -> Result<Self> {
        Self::new(refs)
    }
}

impl From<ShardSet> for Vec<ShardRef> {
    fn from(set: ShardSet) -> Self {
        set.0
    }
}

// =============================================================================
// Quota
// =============================================================================

/// Per-bucket ceiling on logical bytes and object (version) count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_size_bytes: u64,
    pub max_objects: u64,
}

impl Quota {
    pub fn new(max_size_bytes: u64, max_objects: u64) -> Self {
        Self {
            max_size_bytes,
            max_objects,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }
}

impl Default for Quota {
    /// 10 GiB and 10 000 objects.
    fn default() -> Self {
        Self::new(10 * 1024 * 1024 * 1024, 10_000)
    }
}

/// Current consumption of a bucket against its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub used_bytes: u64,
    pub used_objects: u64,
    pub quota: Quota,
}

impl QuotaUsage {
    pub fn bytes_remaining(&self) -> u64 {
        self.quota.max_size_bytes.saturating_sub(self.used_bytes)
    }

    pub fn objects_remaining(&self) -> u64 {
        self.quota.max_objects.saturating_sub(self.used_objects)
    }
}

// =============================================================================
// Erasure Coding Port
// =============================================================================

/// Output of encoding one object.
#[derive(Debug)]
pub struct EncodedData {
    /// All shards, data shards first, each sealed with its checksum
    pub shards: Vec<StoredShard>,
    /// Size of every shard in bytes
    pub shard_size: usize,
    /// Original data length
    pub original_len: usize,
}

impl EncodedData {
    pub fn data_shards(&self) -> &[StoredShard] {
        &self.shards[..DATA_SHARDS.min(self.shards.len())]
    }

    pub fn parity_shards(&self) -> &[StoredShard] {
        &self.shards[DATA_SHARDS.min(self.shards.len())..]
    }
}

/// Port for erasure coding operations.
///
/// Encoding and decoding are pure and deterministic for identical input.
pub trait EcCodec: Send + Sync {
    /// Get the number of data shards (k).
    fn data_shards(&self) -> usize;

    /// Get the number of parity shards (m).
    fn parity_shards(&self) -> usize;

    /// Get the total number of shards (k + m).
    fn total_shards(&self) -> usize {
        self.data_shards() + self.parity_shards()
    }

    /// Split data into k data shards and m parity shards.
    fn encode(&self, data: &[u8]) -> Result<EncodedData>;

    /// Rebuild the original bytes from any k verified shards.
    ///
    /// # Errors
    /// * `InsufficientShards` when fewer than k distinct indices are present
    /// * `CorruptShard` when a shard's checksum does not match its content
    fn decode(&self, shards: &BTreeMap<usize, StoredShard>, original_size: usize)
        -> Result<Vec<u8>>;

    /// Check if the given number of missing shards can be recovered.
    fn can_recover(&self, missing_count: usize) -> bool {
        missing_count <= self.parity_shards()
    }

    /// Calculate the shard size for the given data length.
    fn calculate_shard_size(&self, data_len: usize) -> usize;
}

// =============================================================================
// Shard Transport Port
// =============================================================================

/// Port for shard I/O against a single storage node.
///
/// Implemented once per transport; the coordinator is transport-agnostic.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Store a shard under `shard_id`, overwriting any previous content.
    async fn put_shard(&self, node: &Node, shard_id: &ShardId, shard: &StoredShard) -> Result<()>;

    /// Fetch a shard and its stored checksum.
    async fn get_shard(&self, node: &Node, shard_id: &ShardId) -> Result<StoredShard>;

    /// Delete a shard. Returns `false` if it was already absent.
    async fn delete_shard(&self, node: &Node, shard_id: &ShardId) -> Result<bool>;

    /// List every shard id the node currently stores.
    async fn list_shards(&self, node: &Node) -> Result<Vec<ShardId>>;

    /// Liveness probe; returns the observed round-trip latency.
    async fn probe(&self, node: &Node) -> Result<Duration>;
}

// =============================================================================
// Quota Port
// =============================================================================

/// Port for the per-bucket quota collaborator.
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Install or replace the quota for a bucket.
    async fn set_quota(&self, bucket: &str, quota: Quota);

    /// Forget a deleted bucket.
    async fn remove_bucket(&self, bucket: &str);

    /// Check without reserving.
    async fn check(&self, bucket: &str, additional_bytes: u64, additional_objects: u64)
        -> Result<()>;

    /// Atomically check and reserve, or fail with `QuotaExceeded` leaving usage untouched.
    async fn check_and_reserve(
        &self,
        bucket: &str,
        additional_bytes: u64,
        additional_objects: u64,
    ) -> Result<()>;

    /// Return previously reserved capacity.
    async fn release(&self, bucket: &str, bytes: u64, objects: u64);

    /// Current usage for a bucket.
    async fn usage(&self, bucket: &str) -> Option<QuotaUsage>;

    /// Overwrite usage for a bucket, used when rebuilding from a snapshot.
    async fn restore_usage(&self, bucket: &str, quota: Quota, used_bytes: u64, used_objects: u64);
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
