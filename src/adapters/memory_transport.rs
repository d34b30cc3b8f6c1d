//! In-Memory Shard Transport
//!
//! A `ShardTransport` holding every node's shards in process memory, with
//! fault injection for tests and local experiments: nodes can be taken down,
//! made to fail writes, slowed down, or have a stored shard corrupted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::domain::ports::{Node, NodeId, ShardId, ShardTransport, StoredShard};
use crate::error::{Error, Result};

/// In-memory node fleet.
#[derive(Debug, Default)]
pub struct InMemoryShardTransport {
    shards: DashMap<NodeId, DashMap<ShardId, StoredShard>>,
    down: RwLock<HashSet<NodeId>>,
    failing_writes: RwLock<HashSet<NodeId>>,
    latency: DashMap<NodeId, Duration>,
    puts: AtomicU64,
}

impl InMemoryShardTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a node outage (every call fails with a transport error).
    pub fn set_down(&self, node_id: &NodeId, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(node_id.clone());
        } else {
            set.remove(node_id);
        }
    }

    /// Make puts against a node fail while reads and deletes keep working.
    pub fn fail_writes(&self, node_id: &NodeId, fail: bool) {
        let mut set = self.failing_writes.write();
        if fail {
            set.insert(node_id.clone());
        } else {
            set.remove(node_id);
        }
    }

    /// Delay every call against a node.
    pub fn set_latency(&self, node_id: &NodeId, latency: Duration) {
        self.latency.insert(node_id.clone(), latency);
    }

    /// Flip the first byte of a stored shard, leaving its checksum intact.
    pub fn corrupt(&self, node_id: &NodeId, shard_id: &ShardId) -> bool {
        let Some(node) = self.shards.get(node_id) else {
            return false;
        };
        let Some(mut shard) = node.get_mut(shard_id) else {
            return false;
        };
        let mut bytes = shard.data.to_vec();
        if let Some(first) = bytes.first_mut() {
            *first ^= 0xff;
        }
        shard.data = bytes.into();
        true
    }

    /// Store a shard directly, bypassing fault injection and put counting.
    pub fn insert_raw(&self, node_id: &NodeId, shard_id: ShardId, shard: StoredShard) {
        self.shards
            .entry(node_id.clone())
            .or_default()
            .insert(shard_id, shard);
    }

    pub fn contains(&self, node_id: &NodeId, shard_id: &ShardId) -> bool {
        self.shards
            .get(node_id)
            .map(|node| node.contains_key(shard_id))
            .unwrap_or(false)
    }

    /// Number of shards stored on one node.
    pub fn shard_count(&self, node_id: &NodeId) -> usize {
        self.shards.get(node_id).map(|node| node.len()).unwrap_or(0)
    }

    /// Number of shards stored across all nodes.
    pub fn total_shards(&self) -> usize {
        self.shards.iter().map(|node| node.len()).sum()
    }

    /// Successful puts since creation.
    pub fn total_puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    async fn enter(&self, node: &Node) -> Result<()> {
        let delay = self.latency.get(&node.id).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.read().contains(&node.id) {
            return Err(Error::transport(&node.id, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardTransport for InMemoryShardTransport {
    async fn put_shard(&self, node: &Node, shard_id: &ShardId, shard: &StoredShard) -> Result<()> {
        self.enter(node).await?;
        if self.failing_writes.read().contains(&node.id) {
            return Err(Error::transport(&node.id, "write rejected"));
        }

        self.shards
            .entry(node.id.clone())
            .or_default()
            .insert(shard_id.clone(), shard.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        trace!(node = %node.id, shard = %shard_id, "stored shard");
        Ok(())
    }

    async fn get_shard(&self, node: &Node, shard_id: &ShardId) -> Result<StoredShard> {
        self.enter(node).await?;
        self.shards
            .get(&node.id)
            .and_then(|n| n.get(shard_id).map(|s| s.clone()))
            .ok_or_else(|| Error::ShardNotFound {
                node_id: node.id.to_string(),
                shard_id: shard_id.to_string(),
            })
    }

    async fn delete_shard(&self, node: &Node, shard_id: &ShardId) -> Result<bool> {
        self.enter(node).await?;
        Ok(self
            .shards
            .get(&node.id)
            .map(|n| n.remove(shard_id).is_some())
            .unwrap_or(false))
    }

    async fn list_shards(&self, node: &Node) -> Result<Vec<ShardId>> {
        self.enter(node).await?;
        Ok(self
            .shards
            .get(&node.id)
            .map(|n| n.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn probe(&self, node: &Node) -> Result<Duration> {
        self.enter(node).await?;
        Ok(self.latency.get(&node.id).map(|d| *d).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn node(id: &str) -> Node {
        Node::new(id, format!("mem://{}", id))
    }

    fn sid(s: &str) -> ShardId {
        ShardId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let transport = InMemoryShardTransport::new();
        let n1 = node("n1");
        let shard = StoredShard::seal(vec![1u8, 2, 3]);

        transport.put_shard(&n1, &sid("s1"), &shard).await.unwrap();
        assert_eq!(transport.total_puts(), 1);
        assert_eq!(transport.get_shard(&n1, &sid("s1")).await.unwrap(), shard);
        assert_eq!(transport.list_shards(&n1).await.unwrap(), vec![sid("s1")]);

        assert!(transport.delete_shard(&n1, &sid("s1")).await.unwrap());
        assert!(!transport.delete_shard(&n1, &sid("s1")).await.unwrap());
        assert_matches!(
            transport.get_shard(&n1, &sid("s1")).await,
            Err(Error::ShardNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_down_node() {
        let transport = InMemoryShardTransport::new();
        let n1 = node("n1");
        transport.set_down(&n1.id, true);

        let result = transport
            .put_shard(&n1, &sid("s1"), &StoredShard::seal(vec![0u8]))
            .await;
        assert_matches!(result, Err(Error::Transport { .. }));
        assert!(transport.probe(&n1).await.is_err());

        transport.set_down(&n1.id, false);
        assert!(transport.probe(&n1).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_writes_still_read() {
        let transport = InMemoryShardTransport::new();
        let n1 = node("n1");
        let shard = StoredShard::seal(vec![9u8]);
        transport.insert_raw(&n1.id, sid("s1"), shard.clone());
        transport.fail_writes(&n1.id, true);

        assert!(transport.put_shard(&n1, &sid("s2"), &shard).await.is_err());
        assert_eq!(transport.get_shard(&n1, &sid("s1")).await.unwrap(), shard);
        assert_eq!(transport.total_puts(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_keeps_checksum() {
        let transport = InMemoryShardTransport::new();
        let n1 = node("n1");
        transport.insert_raw(&n1.id, sid("s1"), StoredShard::seal(vec![1u8, 2]));

        assert!(transport.corrupt(&n1.id, &sid("s1")));
        let shard = transport.get_shard(&n1, &sid("s1")).await.unwrap();
        assert!(shard.verify(0).is_err());
        assert!(!transport.corrupt(&n1.id, &sid("missing")));
    }
}
