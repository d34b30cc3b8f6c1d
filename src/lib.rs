//! ShardVault - Erasure-Coded, Deduplicated, Versioned Object Storage
//!
//! Objects are stored once per distinct content (SHA-256 addressed), split into
//! 4 data + 2 parity Reed-Solomon shards, and spread over six distinct storage
//! nodes. Any four shards rebuild the object, so two nodes may be lost at once.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   upload/download  │        StorageEngine         │
//!   delete/list ───▶ │                              │
//!                    │  Ledger ──▶ ContentStore     │
//!                    │                │             │
//!                    │            EcCodec           │
//!                    │                │             │
//!                    │        ShardCoordinator ─────┼──▶ storage nodes
//!                    │                ▲             │    (ShardTransport)
//!                    │  GarbageCollector  NodeRegistry ◀── HealthMonitor
//!                    └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Implementations of the domain ports (codec, transports, quota, events)
//! - [`config`] - Engine configuration and `STORAGE_NODES` parsing
//! - [`domain`] - Value objects, events and port traits
//! - [`ec`] - Reed-Solomon encoder/decoder
//! - [`engine`] - Content store, shard coordinator, ledger, GC and the engine façade
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`node`] - Storage node service (filesystem store + HTTP API)
//! - [`registry`] - Node registry and health monitor

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ec;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod node;
pub mod registry;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{StorageEngine, UploadOptions, UploadReceipt};
pub use error::{Error, Result};
