//! Shard I/O Coordinator
//!
//! Parallel shard put/get/delete against the storage nodes. Individual node
//! failures are absorbed here; only losing the quorum (6 for writes, 4 for
//! reads) or blowing the whole-operation deadline reaches the caller.
//!
//! # Node write locks
//!
//! Every node has an async `RwLock`. A `put_all` holds a read guard on each
//! node it writes to until the caller has recorded the resulting shard set
//! (see [`Placement::into_parts`]); the orphan sweep holds the write guard of
//! one node while it reconciles that node's inventory. A sweep therefore never
//! sees shards that are written but not yet indexed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::domain::ports::{
    ContentHash, Node, NodeId, ShardId, ShardKind, ShardRef, ShardSet, ShardTransport,
    StoredShard, DATA_SHARDS, TOTAL_SHARDS,
};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::registry::NodeRegistry;

/// Read guards on the nodes a placement wrote to.
#[derive(Debug)]
pub struct NodeGuards {
    _guards: Vec<OwnedRwLockReadGuard<()>>,
}

/// A successful `put_all`.
#[derive(Debug)]
pub struct Placement {
    pub shard_set: ShardSet,
    guards: NodeGuards,
}

impl Placement {
    /// Split into the shard set and the node guards.
    ///
    /// Keep the guards alive until the shard set is visible to the orphan
    /// sweep (inserted into the content store).
    pub fn into_parts(self) -> (ShardSet, NodeGuards) {
        (self.shard_set, self.guards)
    }
}

/// Coordinator over the node pool.
pub struct ShardCoordinator {
    config: CoordinatorConfig,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn ShardTransport>,
    node_locks: DashMap<NodeId, Arc<RwLock<()>>>,
    metrics: Option<EngineMetrics>,
}

impl std::fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCoordinator")
            .field("config", &self.config)
            .field("nodes", &self.registry.snapshot().len())
            .finish()
    }
}

impl ShardCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn ShardTransport>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            node_locks: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    fn node_lock(&self, node_id: &NodeId) -> Arc<RwLock<()>> {
        self.node_locks.entry(node_id.clone()).or_default().clone()
    }

    fn shard_error(&self, op: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.shard_errors_total.with_label_values(&[op]).inc();
        }
    }

    /// Exclusive access to a node, excluding in-flight placements.
    pub async fn lock_node_exclusive(&self, node_id: &NodeId) -> OwnedRwLockWriteGuard<()> {
        self.node_lock(node_id).write_owned().await
    }

    // =========================================================================
    // putAll
    // =========================================================================

    /// Write all six shards to six distinct nodes.
    ///
    /// Failed shards are retried on nodes not tried before, up to
    /// `max_placement_retries` extra rounds. If any shard stays unplaced, or
    /// the write deadline passes, every shard attempted is deleted again.
    #[instrument(skip_all, fields(hash = %content_hash.short()))]
    pub async fn put_all(
        &self,
        content_hash: &ContentHash,
        shards: Vec<StoredShard>,
        preferred_region: Option<&str>,
    ) -> Result<Placement> {
        if shards.len() != TOTAL_SHARDS {
            return Err(Error::InvariantViolation(format!(
                "put_all needs {} shards, got {}",
                TOTAL_SHARDS,
                shards.len()
            )));
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.write_deadline();
        let snapshot = self.registry.snapshot();
        let candidates = snapshot.placement_candidates(preferred_region);
        if candidates.len() < TOTAL_SHARDS {
            return Err(Error::PlacementFailed {
                content_hash: content_hash.to_string(),
                reason: format!(
                    "only {} placeable nodes, {} required",
                    candidates.len(),
                    TOTAL_SHARDS
                ),
            });
        }
        let candidate_count = candidates.len();
        let mut candidates = candidates.into_iter();

        let tag = Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut placed: BTreeMap<usize, ShardRef> = BTreeMap::new();
        let mut attempted: Vec<(Node, ShardId)> = Vec::new();
        let mut guards = Vec::new();
        let mut pending: Vec<usize> = (0..TOTAL_SHARDS).collect();

        for round in 0..=self.config.max_placement_retries {
            let mut batch: Vec<(usize, Node)> = Vec::new();
            for index in std::mem::take(&mut pending) {
                match candidates.next() {
                    Some(node) => batch.push((index, node)),
                    None => pending.push(index),
                }
            }
            if batch.is_empty() {
                break;
            }
            if round > 0 {
                info!(round, shards = batch.len(), "retrying shard placement");
            }

            for (index, node) in &batch {
                guards.push(self.node_lock(&node.id).read_owned().await);
                attempted.push((
                    node.clone(),
                    ShardId::for_placement(content_hash, *index, &tag),
                ));
            }

            let writes = batch.into_iter().map(|(index, node)| {
                let shard_id = ShardId::for_placement(content_hash, index, &tag);
                let shard = &shards[index];
                async move {
                    let shard_timeout = self.config.shard_timeout();
                    let put = self.transport.put_shard(&node, &shard_id, shard);
                    let result = match timeout(shard_timeout, put).await {
                        Ok(r) => r,
                        Err(_) => Err(Error::node_timeout(&node.id, "put_shard", shard_timeout)),
                    };
                    (index, node, shard_id, result)
                }
            });

            let results = match tokio::time::timeout_at(deadline, join_all(writes)).await {
                Ok(results) => results,
                Err(_) => {
                    warn!("write deadline exceeded, rolling back");
                    self.rollback(&attempted).await;
                    return Err(Error::timeout("put_all", started.elapsed()));
                }
            };

            for (index, node, shard_id, result) in results {
                match result {
                    Ok(()) => {
                        debug!(index, node = %node.id, "shard placed");
                        placed.insert(
                            index,
                            ShardRef {
                                shard_index: index,
                                kind: ShardKind::for_index(index),
                                node_id: node.id,
                                shard_id,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(index, node = %node.id, "shard write failed: {}", e);
                        self.shard_error("put");
                        pending.push(index);
                    }
                }
            }

            if pending.is_empty() {
                break;
            }
        }

        if !pending.is_empty() {
            let reason = format!(
                "{} of {} shards unplaced after {} retries ({} candidate nodes)",
                pending.len(),
                TOTAL_SHARDS,
                self.config.max_placement_retries,
                candidate_count
            );
            error!("{}", reason);
            self.rollback(&attempted).await;
            return Err(Error::PlacementFailed {
                content_hash: content_hash.to_string(),
                reason,
            });
        }

        let shard_set = ShardSet::new(placed.into_values().collect())?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "all shards placed");
        Ok(Placement {
            shard_set,
            guards: NodeGuards { _guards: guards },
        })
    }

    async fn rollback(&self, attempted: &[(Node, ShardId)]) {
        let deletes = attempted.iter().map(|(node, shard_id)| async move {
            let delete = self.transport.delete_shard(node, shard_id);
            match timeout(self.config.shard_timeout(), delete).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!(node = %node.id, shard = %shard_id, "rollback delete failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!(node = %node.id, shard = %shard_id, "rollback delete timed out");
                    false
                }
            }
        });
        let cleaned = join_all(deletes).await.into_iter().filter(|ok| *ok).count();
        info!(
            cleaned,
            attempted = attempted.len(),
            "rolled back partial placement"
        );
    }

    // =========================================================================
    // getAny4
    // =========================================================================

    /// Read shards until four verified ones are in hand.
    ///
    /// All six reads start together. A shard counts only after its checksum
    /// verifies; once four have, the remaining reads are dropped.
    #[instrument(skip_all, fields(hash = %content_hash.short()))]
    pub async fn get_any4(
        &self,
        content_hash: &ContentHash,
        shard_set: &ShardSet,
    ) -> Result<BTreeMap<usize, StoredShard>> {
        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let shard_timeout = self.config.shard_timeout();

        let mut reads = FuturesUnordered::new();
        for shard_ref in shard_set.iter() {
            let node = snapshot.node(&shard_ref.node_id).cloned();
            reads.push(async move {
                let index = shard_ref.shard_index;
                let result = match node {
                    None => Err(Error::NodeNotFound(shard_ref.node_id.to_string())),
                    Some(node) => {
                        let get = self.transport.get_shard(&node, &shard_ref.shard_id);
                        match timeout(shard_timeout, get).await {
                            Ok(r) => r,
                            Err(_) => Err(Error::node_timeout(&node.id, "get_shard", shard_timeout)),
                        }
                    }
                };
                (index, result.and_then(|shard| shard.verify(index).map(|_| shard)))
            });
        }

        let gather = async {
            let mut valid = BTreeMap::new();
            while let Some((index, result)) = reads.next().await {
                match result {
                    Ok(shard) => {
                        valid.insert(index, shard);
                        if valid.len() == DATA_SHARDS {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(index, "shard read failed: {}", e);
                        self.shard_error("get");
                    }
                }
            }
            valid
        };

        let valid = match timeout(self.config.read_deadline(), gather).await {
            Ok(valid) => valid,
            Err(_) => {
                error!("read deadline exceeded");
                return Err(Error::timeout("get_any4", started.elapsed()));
            }
        };

        if valid.len() < DATA_SHARDS {
            error!(
                available = valid.len(),
                "not enough shards to reconstruct content"
            );
            return Err(Error::ReconstructionImpossible {
                available: valid.len(),
                required: DATA_SHARDS,
            });
        }

        debug!(
            indices = ?valid.keys().collect::<Vec<_>>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "read quorum reached"
        );
        Ok(valid)
    }

    // =========================================================================
    // deleteAll
    // =========================================================================

    /// Delete every shard of a set, best effort.
    ///
    /// Returns how many shards are confirmed gone (deleted now or already
    /// absent). Failures are logged and left for the orphan sweep.
    #[instrument(skip_all)]
    pub async fn delete_all(&self, shard_set: &ShardSet) -> usize {
        let snapshot = self.registry.snapshot();
        let deletes = shard_set.iter().map(|shard_ref| {
            let node = snapshot.node(&shard_ref.node_id).cloned();
            async move {
                let Some(node) = node else {
                    warn!(node = %shard_ref.node_id, "delete skipped: node not registered");
                    return false;
                };
                let delete = self.transport.delete_shard(&node, &shard_ref.shard_id);
                match timeout(self.config.shard_timeout(), delete).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        warn!(node = %node.id, shard = %shard_ref.shard_id, "shard delete failed: {}", e);
                        self.shard_error("delete");
                        false
                    }
                    Err(_) => {
                        warn!(node = %node.id, shard = %shard_ref.shard_id, "shard delete timed out");
                        self.shard_error("delete");
                        false
                    }
                }
            }
        });

        join_all(deletes).await.into_iter().filter(|gone| *gone).count()
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Shard ids a node currently stores.
    pub async fn list_node(&self, node: &Node) -> Result<HashSet<ShardId>> {
        match timeout(self.config.shard_timeout(), self.transport.list_shards(node)).await {
            Ok(Ok(ids)) => Ok(ids.into_iter().collect()),
            Ok(Err(e)) => {
                self.shard_error("list");
                Err(e)
            }
            Err(_) => {
                self.shard_error("list");
                Err(Error::node_timeout(&node.id, "list_shards", self.config.shard_timeout()))
            }
        }
    }

    /// Delete a single shard; `Ok(false)` if it was already gone.
    pub async fn delete_one(&self, node: &Node, shard_id: &ShardId) -> Result<bool> {
        let delete = self.transport.delete_shard(node, shard_id);
        match timeout(self.config.shard_timeout(), delete).await {
            Ok(result) => result,
            Err(_) => Err(Error::node_timeout(&node.id, "delete_shard", self.config.shard_timeout())),
        }
    }
}
