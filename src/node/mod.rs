//! Storage Node
//!
//! The process that actually holds shards: a filesystem store behind a small
//! HTTP API. [`crate::adapters::HttpShardTransport`] is its client.
//!
//! ```text
//! PUT    /internal/shards/{shard_id}   body = shard bytes, x-shard-checksum = crc32 hex
//! GET    /internal/shards/{shard_id}   200 + checksum header, or 404
//! DELETE /internal/shards/{shard_id}   204, or 404 when already gone
//! GET    /internal/shards              JSON ShardInventory
//! GET    /internal/health              200 "ok"
//! ```

pub mod server;
pub mod store;

pub use server::NodeServer;
pub use store::FsShardStore;

use serde::{Deserialize, Serialize};

use crate::domain::ports::ShardId;

pub const SHARDS_PATH: &str = "/internal/shards";
pub const HEALTH_PATH: &str = "/internal/health";
pub const CHECKSUM_HEADER: &str = "x-shard-checksum";

/// Response body of the shard listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInventory {
    pub node_id: String,
    pub shards: Vec<ShardId>,
}
