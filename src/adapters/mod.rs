//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  EcCodec │ ShardTransport │ QuotaManager │ EventPublisher  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ ReedSolomonCodecAdapter │ HttpShardTransport               │ │
//! │  │ InMemoryShardTransport  │ BucketQuotaManager               │ │
//! │  │ Logging / Channel / Composite event publishers             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shardvault::adapters::{HttpShardTransport, ReedSolomonCodecAdapter};
//! use shardvault::domain::ports::ShardTransport;
//!
//! let transport = HttpShardTransport::new(Duration::from_secs(5))?;
//! let latency = transport.probe(&node).await?;
//! ```

mod event_publisher;
mod http_transport;
mod memory_transport;
mod quota;
mod reed_solomon;

pub use event_publisher::{
    ChannelEventPublisher, CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher,
};
pub use http_transport::HttpShardTransport;
pub use memory_transport::InMemoryShardTransport;
pub use quota::BucketQuotaManager;
pub use reed_solomon::ReedSolomonCodecAdapter;
