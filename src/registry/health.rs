//! Health Monitor
//!
//! Periodically probes every registered node and publishes a fresh registry
//! snapshot. A node answering within the degraded threshold is `up`, a slower
//! answer is `degraded`, and an error or probe timeout is `down`.

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{HealthObservation, NodeRegistry, StatusChange};
use crate::config::HealthConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, Node, NodeStatus, ShardTransport};
use crate::metrics::EngineMetrics;

/// Background prober feeding the node registry.
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn ShardTransport>,
    events: Arc<dyn EventPublisher>,
    metrics: Option<EngineMetrics>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn ShardTransport>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            events,
            metrics: None,
        }
    }

    /// Report node counts to the given metrics after every probe round.
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn observe(&self, node: &Node) -> HealthObservation {
        let probe = timeout(self.config.probe_timeout(), self.transport.probe(node));
        let (status, latency) = match probe.await {
            Ok(Ok(latency)) if latency > self.config.degraded_latency() => {
                (NodeStatus::Degraded, Some(latency))
            }
            Ok(Ok(latency)) => (NodeStatus::Up, Some(latency)),
            Ok(Err(e)) => {
                debug!(node = %node.id, "probe failed: {}", e);
                (NodeStatus::Down, None)
            }
            Err(_) => {
                debug!(node = %node.id, "probe timed out");
                (NodeStatus::Down, None)
            }
        };

        HealthObservation {
            node_id: node.id.clone(),
            status,
            latency,
        }
    }

    /// Probe all nodes once, concurrently, and apply the results.
    #[instrument(skip(self))]
    pub async fn check_once(&self) -> Vec<StatusChange> {
        let snapshot = self.registry.snapshot();
        let observations = join_all(snapshot.nodes().iter().map(|n| self.observe(n))).await;
        let changes = self.registry.apply(&observations);

        for change in &changes {
            match change.new_status {
                NodeStatus::Down => warn!(
                    node = %change.node_id,
                    "Node {} -> {}", change.old_status, change.new_status
                ),
                _ => info!(
                    node = %change.node_id,
                    "Node {} -> {}", change.old_status, change.new_status
                ),
            }
            let event = DomainEvent::node_health_changed(
                change.node_id.as_str(),
                change.old_status,
                change.new_status,
            );
            if let Err(e) = self.events.publish(event).await {
                warn!("Failed to publish health event: {}", e);
            }
        }

        if let Some(metrics) = &self.metrics {
            let (up, degraded, down) = self.registry.snapshot().status_counts();
            metrics.set_node_counts(up, degraded, down);
        }

        changes
    }

    /// Probe on a fixed interval until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting health monitor every {:?}", self.config.interval());

        let mut tick = interval(self.config.interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health monitor shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.check_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryShardTransport};
    use crate::domain::ports::NodeId;
    use std::time::Duration;

    fn setup() -> (
        Arc<NodeRegistry>,
        Arc<InMemoryShardTransport>,
        Arc<InMemoryEventCollector>,
        HealthMonitor,
    ) {
        let nodes = (1..=3)
            .map(|i| Node::new(format!("n{}", i), format!("mem://n{}", i)))
            .collect();
        let registry = Arc::new(NodeRegistry::new(nodes).unwrap());
        let transport = Arc::new(InMemoryShardTransport::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let config = HealthConfig {
            interval_secs: 1,
            probe_timeout_ms: 200,
            degraded_latency_ms: 50,
        };
        let monitor = HealthMonitor::new(config, registry.clone(), transport.clone(), events.clone());
        (registry, transport, events, monitor)
    }

    #[tokio::test]
    async fn test_classifies_nodes() {
        let (registry, transport, events, monitor) = setup();
        transport.set_down(&NodeId::new("n2"), true);
        transport.set_latency(&NodeId::new("n3"), Duration::from_millis(80));

        let changes = monitor.check_once().await;
        assert_eq!(changes.len(), 2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.node(&NodeId::new("n1")).unwrap().health_status, NodeStatus::Up);
        assert_eq!(snapshot.node(&NodeId::new("n2")).unwrap().health_status, NodeStatus::Down);
        assert_eq!(
            snapshot.node(&NodeId::new("n3")).unwrap().health_status,
            NodeStatus::Degraded
        );
        assert_eq!(events.events_of_type("NodeHealthChanged").len(), 2);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_down() {
        let (registry, transport, _events, monitor) = setup();
        transport.set_latency(&NodeId::new("n1"), Duration::from_millis(500));

        monitor.check_once().await;
        assert_eq!(
            registry.snapshot().node(&NodeId::new("n1")).unwrap().health_status,
            NodeStatus::Down
        );
    }

    #[tokio::test]
    async fn test_recovery_emits_event() {
        let (registry, transport, events, monitor) = setup();
        transport.set_down(&NodeId::new("n1"), true);
        monitor.check_once().await;

        transport.set_down(&NodeId::new("n1"), false);
        let changes = monitor.check_once().await;

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_status, NodeStatus::Up);
        assert_eq!(registry.snapshot().status_counts(), (3, 0, 0));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_registry, _transport, _events, monitor) = setup();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(monitor).run(shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap();
    }
}
