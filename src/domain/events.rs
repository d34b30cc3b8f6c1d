//! Domain Events
//!
//! Immutable records of completed engine operations, emitted to the event sink
//! for observability. Delivery is fire-and-forget: the engine never fails or
//! waits on an operation because an event could not be published.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::object_uploaded("b1", "a.txt", "v-123", 500, false);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::NodeStatus;

/// Domain event representing a significant occurrence in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Object Events
    // =========================================================================
    /// A version was committed.
    ObjectUploaded {
        bucket: String,
        key: String,
        version_id: String,
        size: u64,
        deduplicated: bool,
        timestamp: DateTime<Utc>,
    },

    /// A version was deleted.
    ObjectDeleted {
        bucket: String,
        key: String,
        version_id: String,
        size: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Garbage Collection Events
    // =========================================================================
    /// An unreferenced content entry and its shards were reclaimed.
    ContentReclaimed {
        content_hash: String,
        size: u64,
        shards_deleted: usize,
        timestamp: DateTime<Utc>,
    },

    /// Orphaned shards were removed from a node.
    OrphanShardsDeleted {
        node_id: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A noncurrent version expired under the retention policy.
    VersionExpired {
        bucket: String,
        key: String,
        version_id: String,
        size: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Failure Events
    // =========================================================================
    /// Shards could not be placed.
    PlacementFailed {
        content_hash: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Not enough shards could be read to rebuild content.
    ReconstructionFailed {
        content_hash: String,
        available: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Health Events
    // =========================================================================
    /// A node changed health status.
    NodeHealthChanged {
        node_id: String,
        old_status: String,
        new_status: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ObjectUploaded { timestamp, .. } => *timestamp,
            DomainEvent::ObjectDeleted { timestamp, .. } => *timestamp,
            DomainEvent::ContentReclaimed { timestamp, .. } => *timestamp,
            DomainEvent::OrphanShardsDeleted { timestamp, .. } => *timestamp,
            DomainEvent::VersionExpired { timestamp, .. } => *timestamp,
            DomainEvent::PlacementFailed { timestamp, .. } => *timestamp,
            DomainEvent::ReconstructionFailed { timestamp, .. } => *timestamp,
            DomainEvent::NodeHealthChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ObjectUploaded { .. } => "ObjectUploaded",
            DomainEvent::ObjectDeleted { .. } => "ObjectDeleted",
            DomainEvent::ContentReclaimed { .. } => "ContentReclaimed",
            DomainEvent::OrphanShardsDeleted { .. } => "OrphanShardsDeleted",
            DomainEvent::VersionExpired { .. } => "VersionExpired",
            DomainEvent::PlacementFailed { .. } => "PlacementFailed",
            DomainEvent::ReconstructionFailed { .. } => "ReconstructionFailed",
            DomainEvent::NodeHealthChanged { .. } => "NodeHealthChanged",
        }
    }

    /// Get the bucket if applicable.
    pub fn bucket(&self) -> Option<&str> {
        match self {
            DomainEvent::ObjectUploaded { bucket, .. } => Some(bucket),
            DomainEvent::ObjectDeleted { bucket, .. } => Some(bucket),
            DomainEvent::VersionExpired { bucket, .. } => Some(bucket),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    /// Create an ObjectUploaded event.
    pub fn object_uploaded(
        bucket: impl Into<String>,
        key: impl Into<String>,
        version_id: impl Into<String>,
        size: u64,
        deduplicated: bool,
    ) -> Self {
        DomainEvent::ObjectUploaded {
            bucket: bucket.into(),
            key: key.into(),
            version_id: version_id.into(),
            size,
            deduplicated,
            timestamp: Utc::now(),
        }
    }

    /// Create an ObjectDeleted event.
    pub fn object_deleted(
        bucket: impl Into<String>,
        key: impl Into<String>,
        version_id: impl Into<String>,
        size: u64,
    ) -> Self {
        DomainEvent::ObjectDeleted {
            bucket: bucket.into(),
            key: key.into(),
            version_id: version_id.into(),
            size,
            timestamp: Utc::now(),
        }
    }

    /// Create a ContentReclaimed event.
    pub fn content_reclaimed(content_hash: impl Into<String>, size: u64, shards_deleted: usize) -> Self {
        DomainEvent::ContentReclaimed {
            content_hash: content_hash.into(),
            size,
            shards_deleted,
            timestamp: Utc::now(),
        }
    }

    /// Create an OrphanShardsDeleted event.
    pub fn orphan_shards_deleted(node_id: impl Into<String>, count: usize) -> Self {
        DomainEvent::OrphanShardsDeleted {
            node_id: node_id.into(),
            count,
            timestamp: Utc::now(),
        }
    }

    /// Create a VersionExpired event.
    pub fn version_expired(
        bucket: impl Into<String>,
        key: impl Into<String>,
        version_id: impl Into<String>,
        size: u64,
    ) -> Self {
        DomainEvent::VersionExpired {
            bucket: bucket.into(),
            key: key.into(),
            version_id: version_id.into(),
            size,
            timestamp: Utc::now(),
        }
    }

    /// Create a PlacementFailed event.
    pub fn placement_failed(content_hash: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainEvent::PlacementFailed {
            content_hash: content_hash.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a ReconstructionFailed event.
    pub fn reconstruction_failed(
        content_hash: impl Into<String>,
        available: usize,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::ReconstructionFailed {
            content_hash: content_hash.into(),
            available,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a NodeHealthChanged event.
    pub fn node_health_changed(
        node_id: impl Into<String>,
        old_status: NodeStatus,
        new_status: NodeStatus,
    ) -> Self {
        DomainEvent::NodeHealthChanged {
            node_id: node_id.into(),
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
            timestamp: Utc::now(),
        }
    }
}
