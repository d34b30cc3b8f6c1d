//! Garbage Collector
//!
//! Reclaims storage that no live version needs any more. One run consists of:
//!
//! 1. **Retention**: noncurrent versions beyond the configured count or age
//!    are deleted like any other version, releasing their content.
//! 2. **Refcount sweep**: every content entry at refcount zero that no read
//!    has pinned gets its shards deleted and its entry removed.
//! 3. **Orphan sweep** (every Nth scheduled run, or on request): each node's
//!    shard inventory is compared with the shard sets of all live entries, and
//!    anything unknown is deleted. The sweep holds that node's write lock, so
//!    it never overlaps a placement writing to the same node.
//!
//! Every pass is idempotent. Errors are logged and retried on the next run;
//! they never reach the request path.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::content_store::ContentStore;
use super::coordinator::ShardCoordinator;
use super::ledger::{Ledger, RetentionPolicy};
use crate::config::GcConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, NodeStatus};
use crate::metrics::EngineMetrics;

/// What a single run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub versions_expired: usize,
    pub entries_reclaimed: usize,
    pub bytes_reclaimed: u64,
    pub shards_deleted: usize,
    /// Shard deletes that failed during reclaim; left for the orphan sweep
    pub shards_left_behind: usize,
    pub orphan_sweep: bool,
    pub nodes_swept: usize,
    pub nodes_skipped: usize,
    pub orphans_deleted: usize,
}

impl GcReport {
    pub fn is_noop(&self) -> bool {
        self.versions_expired == 0
            && self.entries_reclaimed == 0
            && self.shards_deleted == 0
            && self.orphans_deleted == 0
    }
}

/// Scheduler status for operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStatus {
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_report: Option<GcReport>,
    pub next_run: Option<DateTime<Utc>>,
    pub total_versions_expired: u64,
    pub total_entries_reclaimed: u64,
    pub total_bytes_reclaimed: u64,
    pub total_orphans_deleted: u64,
}

/// Background reclamation over the content store, ledger and nodes.
pub struct GarbageCollector {
    config: GcConfig,
    content: Arc<ContentStore>,
    ledger: Arc<Ledger>,
    coordinator: Arc<ShardCoordinator>,
    events: Arc<dyn EventPublisher>,
    metrics: Option<EngineMetrics>,
    status: Mutex<GcStatus>,
    running: AsyncMutex<()>,
    wake: Notify,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("config", &self.config)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl GarbageCollector {
    pub fn new(
        config: GcConfig,
        content: Arc<ContentStore>,
        ledger: Arc<Ledger>,
        coordinator: Arc<ShardCoordinator>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            content,
            ledger,
            coordinator,
            events,
            metrics: None,
            status: Mutex::new(GcStatus::default()),
            running: AsyncMutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn status(&self) -> GcStatus {
        self.status.lock().clone()
    }

    /// Ask the background loop for an early run.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish GC event: {}", e);
        }
    }

    // =========================================================================
    // Passes
    // =========================================================================

    async fn retention_pass(&self, report: &mut GcReport) {
        let policy = RetentionPolicy {
            max_noncurrent_versions: self.config.max_noncurrent_versions,
            noncurrent_retention_days: self.config.noncurrent_retention_days,
        };

        for outcome in self.ledger.expire_noncurrent(policy, Utc::now()).await {
            let v = &outcome.version;
            report.versions_expired += 1;
            self.publish(DomainEvent::version_expired(
                &v.bucket,
                &v.key,
                &v.version_id,
                v.size_bytes,
            ))
            .await;
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .versions_expired_total
                .inc_by(report.versions_expired as u64);
        }
    }

    /// Reclaim every unreferenced, unpinned content entry.
    #[instrument(skip_all)]
    pub async fn refcount_sweep(&self, report: &mut GcReport) {
        for hash in self.content.unreferenced() {
            let coordinator = self.coordinator.clone();
            let reclaimed = self
                .content
                .reclaim(&hash, |shard_set| async move {
                    let total = shard_set.len();
                    let gone = coordinator.delete_all(&shard_set).await;
                    (gone, total - gone)
                })
                .await;

            let Some((entry, (gone, left))) = reclaimed else {
                continue;
            };

            debug!(
                hash = %hash.short(),
                shards_deleted = gone,
                left_behind = left,
                "content reclaimed"
            );
            report.entries_reclaimed += 1;
            report.bytes_reclaimed += entry.size_bytes;
            report.shards_deleted += gone;
            report.shards_left_behind += left;
            self.publish(DomainEvent::content_reclaimed(
                hash.as_str(),
                entry.size_bytes,
                gone,
            ))
            .await;
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .gc_reclaimed_total
                .inc_by(report.entries_reclaimed as u64);
        }
    }

    /// Delete shards on nodes that no live content entry references.
    #[instrument(skip_all)]
    pub async fn orphan_sweep(&self, report: &mut GcReport) {
        report.orphan_sweep = true;
        let snapshot = self.coordinator.registry().snapshot();

        for node in snapshot.nodes() {
            if node.health_status == NodeStatus::Down {
                debug!(node = %node.id, "orphan sweep skipped: node down");
                report.nodes_skipped += 1;
                continue;
            }

            let _exclusive = self.coordinator.lock_node_exclusive(&node.id).await;
            let live = self.content.live_shard_ids();
            let stored = match self.coordinator.list_node(node).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(node = %node.id, "orphan sweep skipped: {}", e);
                    report.nodes_skipped += 1;
                    continue;
                }
            };

            let mut deleted = 0;
            for shard_id in stored.difference(&live) {
                match self.coordinator.delete_one(node, shard_id).await {
                    Ok(_) => deleted += 1,
                    Err(e) => warn!(node = %node.id, shard = %shard_id, "orphan delete failed: {}", e),
                }
            }

            report.nodes_swept += 1;
            if deleted > 0 {
                info!(node = %node.id, deleted, "orphan shards deleted");
                report.orphans_deleted += deleted;
                self.publish(DomainEvent::orphan_shards_deleted(node.id.as_str(), deleted))
                    .await;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .gc_orphans_deleted_total
                .inc_by(report.orphans_deleted as u64);
        }
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Run all passes once. Concurrent calls queue behind each other.
    pub async fn run_once(&self, include_orphans: bool) -> GcReport {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let mut report = GcReport {
            started_at: Some(Utc::now()),
            ..GcReport::default()
        };

        self.retention_pass(&mut report).await;
        self.refcount_sweep(&mut report).await;
        if include_orphans {
            self.orphan_sweep(&mut report).await;
        }
        self.content.prune_locks();

        report.duration_ms = started.elapsed().as_millis() as u64;
        if let Some(metrics) = &self.metrics {
            metrics.gc_runs_total.inc();
            metrics.content_entries.set(self.content.len() as i64);
        }

        if report.is_noop() {
            debug!(duration_ms = report.duration_ms, "GC run found nothing to do");
        } else {
            info!(
                expired = report.versions_expired,
                reclaimed = report.entries_reclaimed,
                shards_deleted = report.shards_deleted,
                orphans_deleted = report.orphans_deleted,
                duration_ms = report.duration_ms,
                "GC run complete"
            );
        }

        let mut status = self.status.lock();
        status.runs += 1;
        status.last_run = report.started_at;
        status.total_versions_expired += report.versions_expired as u64;
        status.total_entries_reclaimed += report.entries_reclaimed as u64;
        status.total_bytes_reclaimed += report.bytes_reclaimed;
        status.total_orphans_deleted += report.orphans_deleted as u64;
        status.last_report = Some(report.clone());

        report
    }

    fn schedule_next(&self) {
        let next = ChronoDuration::from_std(self.config.interval())
            .ok()
            .map(|d| Utc::now() + d);
        self.status.lock().next_run = next;
    }

    /// Run on the configured interval, or earlier when triggered, until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting garbage collector every {:?}, orphan sweep every {} runs",
            self.config.interval(),
            self.config.orphan_sweep_every
        );

        let mut tick = interval(self.config.interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;
        self.schedule_next();

        let mut scheduled: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Garbage collector shutting down");
                    break;
                }
                _ = tick.tick() => {
                    scheduled += 1;
                    let every = self.config.orphan_sweep_every;
                    let orphans = every > 0 && scheduled % every == 0;
                    self.run_once(orphans).await;
                    self.schedule_next();
                }
                _ = self.wake.notified() => {
                    self.run_once(false).await;
                }
            }
        }
    }
}
