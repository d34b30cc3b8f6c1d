//! Domain Layer
//!
//! Value objects, events and the port traits the engine is written against.
//!
//! - **Ports** (`ports.rs`) - identifiers, shard types and trait abstractions
//!   for codecs, node transports, quota and event sinks
//! - **Events** (`events.rs`) - records of completed operations

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    ContentHash, EcCodec, EncodedData, EventPublisher, Node, NodeId, NodeStatus, Quota,
    QuotaManager, QuotaUsage, ShardId, ShardKind, ShardRef, ShardSet, ShardTransport,
    StoredShard, DATA_SHARDS, PARITY_SHARDS, TOTAL_SHARDS,
};
