//! HTTP Shard Transport
//!
//! Implements the `ShardTransport` port against storage nodes running the
//! `shardvault node` service (see [`crate::node`]).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use crate::domain::ports::{Node, ShardId, ShardTransport, StoredShard};
use crate::error::{Error, Result};
use crate::node::{ShardInventory, CHECKSUM_HEADER, HEALTH_PATH, SHARDS_PATH};

/// Shard transport speaking the node HTTP protocol.
#[derive(Debug, Clone)]
pub struct HttpShardTransport {
    client: Client,
}

impl HttpShardTransport {
    /// Create a transport whose every request is bounded by `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn shard_url(node: &Node, shard_id: &ShardId) -> String {
        format!(
            "{}{}/{}",
            node.base_url.trim_end_matches('/'),
            SHARDS_PATH,
            urlencoding::encode(shard_id.as_str())
        )
    }

    fn url(node: &Node, path: &str) -> String {
        format!("{}{}", node.base_url.trim_end_matches('/'), path)
    }
}

fn unexpected(node: &Node, op: &str, status: StatusCode) -> Error {
    Error::transport(&node.id, format!("{} returned {}", op, status))
}

fn connect_error(node: &Node, e: reqwest::Error) -> Error {
    Error::transport(&node.id, e.to_string())
}

fn parse_checksum(node: &Node, value: Option<&reqwest::header::HeaderValue>) -> Result<u32> {
    let raw = value
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::transport(&node.id, "missing checksum header"))?;
    u32::from_str_radix(raw, 16)
        .map_err(|_| Error::transport(&node.id, format!("malformed checksum header: {}", raw)))
}

#[async_trait]
impl ShardTransport for HttpShardTransport {
    #[instrument(skip(self, node, shard), fields(node = %node.id, shard = %shard_id, len = shard.len()))]
    async fn put_shard(&self, node: &Node, shard_id: &ShardId, shard: &StoredShard) -> Result<()> {
        let response = self
            .client
            .put(Self::shard_url(node, shard_id))
            .header(CHECKSUM_HEADER, format!("{:08x}", shard.checksum))
            .body(shard.data.clone())
            .send()
            .await
            .map_err(|e| connect_error(node, e))?;

        if !response.status().is_success() {
            return Err(unexpected(node, "put", response.status()));
        }
        debug!("shard stored");
        Ok(())
    }

    #[instrument(skip(self, node), fields(node = %node.id, shard = %shard_id))]
    async fn get_shard(&self, node: &Node, shard_id: &ShardId) -> Result<StoredShard> {
        let response = self
            .client
            .get(Self::shard_url(node, shard_id))
            .send()
            .await
            .map_err(|e| connect_error(node, e))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::ShardNotFound {
                    node_id: node.id.to_string(),
                    shard_id: shard_id.to_string(),
                })
            }
            status => return Err(unexpected(node, "get", status)),
        }

        let checksum = parse_checksum(node, response.headers().get(CHECKSUM_HEADER))?;
        let data = response.bytes().await.map_err(|e| connect_error(node, e))?;
        Ok(StoredShard { data, checksum })
    }

    #[instrument(skip(self, node), fields(node = %node.id, shard = %shard_id))]
    async fn delete_shard(&self, node: &Node, shard_id: &ShardId) -> Result<bool> {
        let response = self
            .client
            .delete(Self::shard_url(node, shard_id))
            .send()
            .await
            .map_err(|e| connect_error(node, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(unexpected(node, "delete", status)),
        }
    }

    async fn list_shards(&self, node: &Node) -> Result<Vec<ShardId>> {
        let response = self
            .client
            .get(Self::url(node, SHARDS_PATH))
            .send()
            .await
            .map_err(|e| connect_error(node, e))?;

        if !response.status().is_success() {
            return Err(unexpected(node, "list", response.status()));
        }

        let inventory: ShardInventory = response
            .json()
            .await
            .map_err(|e| Error::transport(&node.id, format!("bad inventory: {}", e)))?;
        Ok(inventory.shards)
    }

    async fn probe(&self, node: &Node) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(Self::url(node, HEALTH_PATH))
            .send()
            .await
            .map_err(|e| connect_error(node, e))?;

        if !response.status().is_success() {
            return Err(unexpected(node, "health", response.status()));
        }
        Ok(started.elapsed())
    }
}
