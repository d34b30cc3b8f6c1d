//! Storage Engine
//!
//! The request-layer contract over the core components:
//!
//! ```text
//! upload:   bytes ─▶ ContentStore (hash, dedup) ─▶ [new] EcCodec ─▶ Coordinator.put_all
//!                                                              ─▶ Ledger.commit_version
//! download: Ledger.resolve ─▶ ContentStore.pin ─▶ Coordinator.get_any4 ─▶ EcCodec.decode
//! delete:   Ledger.delete_version ─▶ ContentStore.release ─▶ GC (refcount 0)
//! ```
//!
//! Events are published after each completed operation. Publishing never
//! fails the operation.

pub mod content_store;
pub mod coordinator;
pub mod gc;
pub mod ledger;
pub mod snapshot;

pub use content_store::{ContentEntry, ContentStore, DedupStats};
pub use coordinator::ShardCoordinator;
pub use gc::{GarbageCollector, GcReport, GcStatus};
pub use ledger::{Bucket, DeleteOutcome, Ledger, Version, VersionSummary};
pub use snapshot::MetadataSnapshot;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::adapters::{BucketQuotaManager, ReedSolomonCodecAdapter};
use crate::config::EngineConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    ContentHash, EcCodec, EventPublisher, Node, Quota, QuotaManager, QuotaUsage, ShardTransport,
};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::registry::{HealthMonitor, NodeRegistry};

/// Per-upload options.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Region whose nodes are preferred for new placements
    pub preferred_region: Option<String>,
}

/// Result of a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub version_id: String,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    /// No shards were written; existing content was referenced
    pub deduplicated: bool,
    /// Version removed by this upload (versioning disabled)
    pub superseded: Option<String>,
}

/// Node counts by health status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    pub up: usize,
    pub degraded: usize,
    pub down: usize,
}

/// Operator-facing summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub buckets: usize,
    pub dedup: DedupStats,
    pub nodes: NodeCounts,
    pub gc: GcStatus,
}

/// Erasure-coded, deduplicated, versioned object store.
pub struct StorageEngine {
    config: EngineConfig,
    registry: Arc<NodeRegistry>,
    codec: Arc<dyn EcCodec>,
    content: Arc<ContentStore>,
    coordinator: Arc<ShardCoordinator>,
    ledger: Arc<Ledger>,
    quota: Arc<dyn QuotaManager>,
    gc: Arc<GarbageCollector>,
    health: Arc<HealthMonitor>,
    events: Arc<dyn EventPublisher>,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("nodes", &self.registry.snapshot().len())
            .field("contents", &self.content.len())
            .finish()
    }
}

impl StorageEngine {
    /// Assemble an engine over `nodes`, reached through `transport`.
    pub fn new(
        config: EngineConfig,
        nodes: Vec<Node>,
        transport: Arc<dyn ShardTransport>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = EngineMetrics::new()?;
        let registry = Arc::new(NodeRegistry::new(nodes)?);
        let codec: Arc<dyn EcCodec> = Arc::new(ReedSolomonCodecAdapter::standard_4_2()?);
        let quota: Arc<dyn QuotaManager> = Arc::new(BucketQuotaManager::new());
        let content = Arc::new(ContentStore::new());
        let ledger = Arc::new(Ledger::new(content.clone(), quota.clone()));

        let coordinator = Arc::new(
            ShardCoordinator::new(config.coordinator.clone(), registry.clone(), transport.clone())
                .with_metrics(metrics.clone()),
        );
        let gc = Arc::new(
            GarbageCollector::new(
                config.gc.clone(),
                content.clone(),
                ledger.clone(),
                coordinator.clone(),
                events.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let health = Arc::new(
            HealthMonitor::new(config.health.clone(), registry.clone(), transport, events.clone())
                .with_metrics(metrics.clone()),
        );

        let (up, degraded, down) = registry.snapshot().status_counts();
        metrics.set_node_counts(up, degraded, down);
        info!(nodes = registry.snapshot().len(), "storage engine ready");

        Ok(Self {
            config,
            registry,
            codec,
            content,
            coordinator,
            ledger,
            quota,
            gc,
            health,
            events,
            metrics,
        })
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        &self.content
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Start the GC and health loops; they stop when `shutdown` is cancelled.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.gc.clone().run(shutdown.clone())),
            tokio::spawn(self.health.clone().run(shutdown)),
        ]
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    /// Create a bucket; `None` applies the configured default quota.
    pub async fn create_bucket(&self, name: &str, versioning_enabled: bool, quota: Option<Quota>) -> Result<Bucket> {
        let quota = quota.unwrap_or(self.config.default_quota);
        self.ledger.create_bucket(name, versioning_enabled, quota).await
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.ledger.delete_bucket(name).await
    }

    pub fn set_versioning(&self, name: &str, enabled: bool) -> Result<Bucket> {
        self.ledger.set_versioning(name, enabled)
    }

    pub async fn set_quota(&self, name: &str, quota: Quota) -> Result<Bucket> {
        self.ledger.set_quota(name, quota).await
    }

    pub fn bucket(&self, name: &str) -> Result<Bucket> {
        self.ledger.bucket(name)
    }

    pub fn list_buckets(&self) -> Vec<Bucket> {
        self.ledger.list_buckets()
    }

    pub async fn quota_usage(&self, bucket: &str) -> Result<QuotaUsage> {
        self.quota
            .usage(bucket)
            .await
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Store `data` as the new latest version of `key` and return its version id.
    pub async fn upload(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> Result<String> {
        let receipt = self
            .upload_with(bucket, key, data.into(), UploadOptions::default())
            .await?;
        Ok(receipt.version_id)
    }

    #[instrument(skip(self, data, options), fields(size = data.len()))]
    pub async fn upload_with(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> Result<UploadReceipt> {
        let timer = self
            .metrics
            .operation_seconds
            .with_label_values(&["upload"])
            .start_timer();
        let size = data.len() as u64;

        // Reject before any shard is written
        self.ledger.preflight(bucket, key, size).await?;

        let hash = ContentHash::of(&data);
        let region = options.preferred_region.as_deref();
        let outcome = self
            .content
            .create_or_ref_with(&hash, size, || async {
                let encoded = match self.codec.encode(&data) {
                    Ok(encoded) => encoded,
                    Err(e) => return Err(e),
                };
                match self.coordinator.put_all(&hash, encoded.shards, region).await {
                    Ok(placement) => Ok(placement.into_parts()),
                    Err(e) => {
                        self.metrics.placement_failures_total.inc();
                        self.emit(DomainEvent::placement_failed(hash.as_str(), e.to_string()))
                            .await;
                        Err(e)
                    }
                }
            })
            .await?;

        let commit = match self.ledger.commit_version(bucket, key, &hash, size).await {
            Ok(commit) => commit,
            Err(e) => {
                self.abandon(&hash).await;
                return Err(e);
            }
        };

        let deduplicated = outcome.deduplicated;
        let label = if deduplicated { "deduplicated" } else { "stored" };
        self.metrics.uploads_total.with_label_values(&[label]).inc();
        self.metrics.bytes_in_total.inc_by(size);
        self.metrics.content_entries.set(self.content.len() as i64);

        let version = &commit.version;
        info!(
            bucket,
            key,
            version_id = %version.version_id,
            hash = %hash.short(),
            deduplicated,
            "object uploaded"
        );
        self.emit(DomainEvent::object_uploaded(
            bucket,
            key,
            &version.version_id,
            size,
            deduplicated,
        ))
        .await;

        if let Some(old) = &commit.superseded {
            self.emit(DomainEvent::object_deleted(
                bucket,
                key,
                &old.version_id,
                old.size_bytes,
            ))
            .await;
            if commit.superseded_refcount == Some(0) {
                self.gc.trigger();
            }
        }

        timer.observe_duration();
        Ok(UploadReceipt {
            version_id: version.version_id.clone(),
            content_hash: hash,
            size_bytes: size,
            deduplicated,
            superseded: commit.superseded.map(|v| v.version_id),
        })
    }

    /// Drop the reference taken for a commit that did not happen.
    async fn abandon(&self, hash: &ContentHash) {
        match self.content.release(hash).await {
            Ok(0) => {
                let coordinator = self.coordinator.clone();
                let reclaimed = self
                    .content
                    .reclaim(hash, |shard_set| async move {
                        coordinator.delete_all(&shard_set).await
                    })
                    .await;
                if let Some((_, deleted)) = reclaimed {
                    info!(hash = %hash.short(), deleted, "abandoned content reclaimed");
                }
            }
            Ok(_) => {}
            Err(e) => error!(hash = %hash.short(), "failed to release abandoned content: {}", e),
        }
    }

    // =========================================================================
    // Download
    // =========================================================================

    /// Read a version (latest when `version_id` is `None`).
    #[instrument(skip(self))]
    pub async fn download(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Result<Bytes> {
        let timer = self
            .metrics
            .operation_seconds
            .with_label_values(&["download"])
            .start_timer();

        let version = self.ledger.resolve(bucket, key, version_id).await?;
        let hash = &version.content_hash;

        // Deleted and reclaimed between resolve and pin
        let pin = match self.content.pin(hash).await {
            Ok(pin) => pin,
            Err(Error::ContentNotFound(_)) => {
                return Err(match version_id {
                    Some(id) => Error::VersionNotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        version_id: id.to_string(),
                    },
                    None => Error::ObjectNotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    },
                })
            }
            Err(e) => return Err(e),
        };
        let entry = pin.entry();

        let shards = match self.coordinator.get_any4(hash, &entry.shard_set).await {
            Ok(shards) => shards,
            Err(e) => {
                if let Error::ReconstructionImpossible { available, .. } = &e {
                    self.metrics.reconstruction_failures_total.inc();
                    self.emit(DomainEvent::reconstruction_failed(
                        hash.as_str(),
                        *available,
                        e.to_string(),
                    ))
                    .await;
                }
                return Err(e);
            }
        };

        let data = self.codec.decode(&shards, entry.size_bytes as usize)?;
        if ContentHash::of(&data) != *hash {
            let err = Error::InvariantViolation(format!(
                "content {} decoded to bytes with a different hash",
                hash
            ));
            error!("{}", err);
            return Err(err);
        }
        drop(pin);

        self.metrics.downloads_total.inc();
        self.metrics.bytes_out_total.inc_by(data.len() as u64);
        timer.observe_duration();
        Ok(Bytes::from(data))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a version (latest when `version_id` is `None`).
    #[instrument(skip(self))]
    pub async fn delete(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Result<DeleteOutcome> {
        let outcome = match version_id {
            Some(id) => self.ledger.delete_version(bucket, key, id).await?,
            None => self.ledger.delete_latest(bucket, key).await?,
        };

        let version = &outcome.version;
        info!(
            bucket,
            key,
            version_id = %version.version_id,
            refcount_after = outcome.refcount_after,
            "version deleted"
        );
        self.metrics.deletes_total.inc();
        self.emit(DomainEvent::object_deleted(
            bucket,
            key,
            &version.version_id,
            version.size_bytes,
        ))
        .await;

        if outcome.refcount_after == 0 {
            self.gc.trigger();
        }
        Ok(outcome)
    }

    // =========================================================================
    // Listing and stats
    // =========================================================================

    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<VersionSummary>> {
        self.ledger.list_objects(bucket).await
    }

    pub async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<VersionSummary>> {
        self.ledger.list_versions(bucket, key).await
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.content.stats()
    }

    pub fn stats(&self) -> EngineStats {
        let (up, degraded, down) = self.registry.snapshot().status_counts();
        EngineStats {
            buckets: self.ledger.list_buckets().len(),
            dedup: self.content.stats(),
            nodes: NodeCounts { up, degraded, down },
            gc: self.gc.status(),
        }
    }

    /// Run the garbage collector now.
    pub async fn run_gc(&self, include_orphans: bool) -> GcReport {
        self.gc.run_once(include_orphans).await
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Consistent copy of all metadata.
    ///
    /// Versions are read before contents and no entry is reclaimed in
    /// between, so every captured version has its content entry.
    pub async fn snapshot(&self) -> MetadataSnapshot {
        let _fence = self.content.hold_reclaims().await;
        let (buckets, versions) = self.ledger.export().await;
        let contents = self.content.entries();
        MetadataSnapshot::new(buckets, versions, contents)
    }

    /// Replace all metadata with a snapshot's.
    pub async fn restore(&self, snapshot: MetadataSnapshot) -> Result<()> {
        let contents = snapshot.reconciled_contents()?;
        let entries = contents.len();
        self.content.restore(contents);
        self.ledger.restore(snapshot.buckets, snapshot.versions).await?;
        self.metrics.content_entries.set(entries as i64);
        info!(entries, "metadata restored");
        Ok(())
    }

    pub async fn save_metadata(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot().await.save(path).await
    }

    /// Restore from `path` if it exists. Returns whether anything was loaded.
    pub async fn load_metadata(&self, path: impl AsRef<Path>) -> Result<bool> {
        match MetadataSnapshot::load(path).await? {
            Some(snapshot) => {
                self.restore(snapshot).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
