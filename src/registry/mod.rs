//! Node Registry
//!
//! The pool of storage nodes and their health, held as an immutable
//! [`RegistrySnapshot`]. Readers take an `Arc` to the current snapshot and keep
//! using it for the whole operation; health updates build a new snapshot and
//! swap it in, so nothing an operation has already seen changes underneath it.

pub mod health;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::domain::ports::{Node, NodeId, NodeStatus};
use crate::error::{Error, Result};

pub use health::HealthMonitor;

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of the node pool at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    nodes: Vec<Node>,
    generation: u64,
}

impl RegistrySnapshot {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Monotonic counter bumped by every health update.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that may receive shards, best first.
    ///
    /// `up` nodes come before `degraded` ones and `down` nodes are excluded.
    /// Within a health class, nodes in `preferred_region` come first, then
    /// lower observed latency; unprobed nodes sort after probed ones, and ties
    /// fall back to node id so the order is deterministic.
    pub fn placement_candidates(&self, preferred_region: Option<&str>) -> Vec<Node> {
        let mut candidates: Vec<(u8, &Node)> = self
            .nodes
            .iter()
            .filter_map(|n| n.health_status.placement_rank().map(|rank| (rank, n)))
            .collect();

        candidates.sort_by(|(rank_a, a), (rank_b, b)| {
            rank_a
                .cmp(rank_b)
                .then_with(|| region_order(a, b, preferred_region))
                .then_with(|| latency_order(a.last_latency, b.last_latency))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.into_iter().map(|(_, n)| n.clone()).collect()
    }

    /// Count of nodes per health status: (up, degraded, down).
    pub fn status_counts(&self) -> (usize, usize, usize) {
        self.nodes
            .iter()
            .fold((0, 0, 0), |(up, degraded, down), n| match n.health_status {
                NodeStatus::Up => (up + 1, degraded, down),
                NodeStatus::Degraded => (up, degraded + 1, down),
                NodeStatus::Down => (up, degraded, down + 1),
            })
    }
}

fn region_order(a: &Node, b: &Node, preferred: Option<&str>) -> Ordering {
    let Some(preferred) = preferred else {
        return Ordering::Equal;
    };
    let a_local = a.region.as_deref() == Some(preferred);
    let b_local = b.region.as_deref() == Some(preferred);
    b_local.cmp(&a_local)
}

fn latency_order(a: Option<Duration>, b: Option<Duration>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// =============================================================================
// Registry
// =============================================================================

/// One observed health sample for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthObservation {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub latency: Option<Duration>,
}

/// A status transition produced by applying observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub node_id: NodeId,
    pub old_status: NodeStatus,
    pub new_status: NodeStatus,
}

/// Holder of the current snapshot.
#[derive(Debug)]
pub struct NodeRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl NodeRegistry {
    /// Register the node pool. Ids must be unique.
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|other| other.id == node.id) {
                return Err(Error::Config(format!("duplicate node id {}", node.id)));
            }
        }

        info!("Registered {} storage nodes", nodes.len());
        Ok(Self {
            current: RwLock::new(Arc::new(RegistrySnapshot {
                nodes,
                generation: 0,
            })),
        })
    }

    /// The snapshot to use for one operation.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Apply health observations as a new snapshot and report transitions.
    ///
    /// Observations for unknown node ids are ignored.
    pub fn apply(&self, observations: &[HealthObservation]) -> Vec<StatusChange> {
        let mut current = self.current.write();
        let mut nodes = current.nodes.clone();
        let mut changes = Vec::new();

        for obs in observations {
            let Some(node) = nodes.iter_mut().find(|n| n.id == obs.node_id) else {
                continue;
            };
            if node.health_status != obs.status {
                changes.push(StatusChange {
                    node_id: node.id.clone(),
                    old_status: node.health_status,
                    new_status: obs.status,
                });
            }
            node.health_status = obs.status;
            if obs.latency.is_some() {
                node.last_latency = obs.latency;
            }
        }

        let generation = current.generation + 1;
        *current = Arc::new(RegistrySnapshot { nodes, generation });
        changes
    }

    /// Force a node's status.
    pub fn set_status(&self, node_id: &NodeId, status: NodeStatus) -> Result<Option<StatusChange>> {
        if self.snapshot().node(node_id).is_none() {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        Ok(self
            .apply(&[HealthObservation {
                node_id: node_id.clone(),
                status,
                latency: None,
            }])
            .pop())
    }
}
