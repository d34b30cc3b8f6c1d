//! Engine Metrics
//!
//! Prometheus collectors owned by the storage engine. Each engine carries its
//! own `Registry` so several engines (or test instances) never collide on
//! metric names.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::domain::ports::NodeStatus;
use crate::error::{Error, Result};

const NAMESPACE: &str = "shardvault";

/// All engine collectors plus the registry they are registered in.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,

    /// Completed uploads by outcome (`stored` or `deduplicated`)
    pub uploads_total: IntCounterVec,
    pub downloads_total: IntCounter,
    pub deletes_total: IntCounter,
    pub bytes_in_total: IntCounter,
    pub bytes_out_total: IntCounter,

    /// Per-shard I/O failures by operation (`put`, `get`, `delete`, `list`)
    pub shard_errors_total: IntCounterVec,
    pub placement_failures_total: IntCounter,
    pub reconstruction_failures_total: IntCounter,

    pub gc_runs_total: IntCounter,
    pub gc_reclaimed_total: IntCounter,
    pub gc_orphans_deleted_total: IntCounter,
    pub versions_expired_total: IntCounter,

    pub content_entries: IntGauge,
    pub nodes: IntGaugeVec,

    /// Engine operation latency by operation name
    pub operation_seconds: HistogramVec,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE)).map_err(metric_err)?;
    registry.register(Box::new(c.clone())).map_err(metric_err)?;
    Ok(c)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .map_err(metric_err)?;
    registry.register(Box::new(c.clone())).map_err(metric_err)?;
    Ok(c)
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let content_entries = IntGauge::with_opts(
            Opts::new("content_entries", "Content entries in the dedup index").namespace(NAMESPACE),
        )
        .map_err(metric_err)?;
        registry
            .register(Box::new(content_entries.clone()))
            .map_err(metric_err)?;

        let nodes = IntGaugeVec::new(
            Opts::new("nodes", "Storage nodes by health status").namespace(NAMESPACE),
            &["status"],
        )
        .map_err(metric_err)?;
        registry.register(Box::new(nodes.clone())).map_err(metric_err)?;

        let operation_seconds = HistogramVec::new(
            HistogramOpts::new("operation_seconds", "Engine operation latency")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0]),
            &["operation"],
        )
        .map_err(metric_err)?;
        registry
            .register(Box::new(operation_seconds.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            uploads_total: counter_vec(&registry, "uploads_total", "Completed uploads", &["outcome"])?,
            downloads_total: counter(&registry, "downloads_total", "Completed downloads")?,
            deletes_total: counter(&registry, "deletes_total", "Deleted versions")?,
            bytes_in_total: counter(&registry, "bytes_in_total", "Logical bytes uploaded")?,
            bytes_out_total: counter(&registry, "bytes_out_total", "Logical bytes downloaded")?,
            shard_errors_total: counter_vec(
                &registry,
                "shard_errors_total",
                "Per-shard I/O failures",
                &["op"],
            )?,
            placement_failures_total: counter(
                &registry,
                "placement_failures_total",
                "Uploads whose shards could not be placed",
            )?,
            reconstruction_failures_total: counter(
                &registry,
                "reconstruction_failures_total",
                "Reads that could not collect enough shards",
            )?,
            gc_runs_total: counter(&registry, "gc_runs_total", "Garbage collector runs")?,
            gc_reclaimed_total: counter(
                &registry,
                "gc_reclaimed_total",
                "Content entries reclaimed",
            )?,
            gc_orphans_deleted_total: counter(
                &registry,
                "gc_orphans_deleted_total",
                "Orphaned shards deleted",
            )?,
            versions_expired_total: counter(
                &registry,
                "versions_expired_total",
                "Noncurrent versions expired by retention",
            )?,
            content_entries,
            nodes,
            operation_seconds,
            registry,
        })
    }

    /// Publish the node status breakdown.
    pub fn set_node_counts(&self, up: usize, degraded: usize, down: usize) {
        for (status, count) in [
            (NodeStatus::Up, up),
            (NodeStatus::Degraded, degraded),
            (NodeStatus::Down, down),
        ] {
            self.nodes
                .with_label_values(&[&status.to_string()])
                .set(count as i64);
        }
    }

    /// Render every collector in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.downloads_total.inc();
        assert_eq!(a.downloads_total.get(), 1);
        assert_eq!(b.downloads_total.get(), 0);
    }

    #[test]
    fn test_encode_contains_metrics() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.uploads_total.with_label_values(&["deduplicated"]).inc();
        metrics.set_node_counts(5, 1, 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("shardvault_uploads_total{outcome=\"deduplicated\"} 1"));
        assert!(text.contains("shardvault_nodes{status=\"up\"} 5"));
        assert!(text.contains("shardvault_nodes{status=\"down\"} 0"));
    }
}
