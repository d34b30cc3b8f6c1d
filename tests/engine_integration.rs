//! Engine Integration Tests
//!
//! Full upload / download / delete / GC flows against in-memory nodes.

use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;

use shardvault::adapters::{
    CompositeEventPublisher, InMemoryEventCollector, InMemoryShardTransport, LoggingEventPublisher,
};
use shardvault::config::{CoordinatorConfig, EngineConfig};
use shardvault::domain::ports::{ContentHash, Node, NodeId, Quota, ShardId, StoredShard};
use shardvault::{Error, StorageEngine, UploadOptions};

// =============================================================================
// Fixture
// =============================================================================

struct Cluster {
    engine: Arc<StorageEngine>,
    transport: Arc<InMemoryShardTransport>,
    events: Arc<InMemoryEventCollector>,
}

fn config() -> EngineConfig {
    EngineConfig {
        coordinator: CoordinatorConfig {
            shard_timeout_ms: 200,
            read_deadline_ms: 2_000,
            write_deadline_ms: 4_000,
            max_placement_retries: 2,
        },
        ..EngineConfig::default()
    }
}

fn nodes(count: usize) -> Vec<Node> {
    (1..=count)
        .map(|i| Node::new(format!("node{}", i), format!("mem://node{}", i)))
        .collect()
}

fn cluster_with(count: usize, transport: Arc<InMemoryShardTransport>) -> Cluster {
    let events = Arc::new(InMemoryEventCollector::new());
    let publisher = CompositeEventPublisher::new()
        .with_publisher(events.clone())
        .with_publisher(Arc::new(LoggingEventPublisher::debug_level()));
    let engine = StorageEngine::new(config(), nodes(count), transport.clone(), Arc::new(publisher))
        .expect("engine");
    Cluster {
        engine: Arc::new(engine),
        transport,
        events,
    }
}

fn cluster(count: usize) -> Cluster {
    cluster_with(count, Arc::new(InMemoryShardTransport::new()))
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn refcount(engine: &StorageEngine, data: &[u8]) -> Option<u64> {
    engine
        .content_store()
        .find(&ContentHash::of(data))
        .map(|e| e.refcount)
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_dedup_delete_and_gc_lifecycle() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, Some(Quota::new(1000, 10))).await.unwrap();

    let data = payload(500, 7);
    let v1 = e.upload("b1", "a.txt", data.clone()).await.unwrap();
    let latest = e.list_versions("b1", "a.txt").await.unwrap();
    assert_eq!(latest[0].version_id, v1);
    assert!(latest[0].is_latest);
    assert_eq!(c.transport.total_puts(), 6);

    // Identical bytes under another key: no new shards
    let receipt = e
        .upload_with("b1", "b.txt", Bytes::from(data.clone()), UploadOptions::default())
        .await
        .unwrap();
    assert!(receipt.deduplicated);
    assert_eq!(refcount(e, &data), Some(2));
    assert_eq!(c.transport.total_puts(), 6);
    assert_eq!(e.download("b1", "b.txt", None).await.unwrap(), data);

    e.delete("b1", "a.txt", None).await.unwrap();
    assert_eq!(refcount(e, &data), Some(1));
    assert!(e.run_gc(false).await.is_noop());
    assert_eq!(c.transport.total_shards(), 6);

    e.delete("b1", "b.txt", None).await.unwrap();
    assert_eq!(refcount(e, &data), Some(0));
    let report = e.run_gc(false).await;
    assert_eq!(report.entries_reclaimed, 1);
    assert_eq!(report.shards_deleted, 6);
    assert_eq!(c.transport.total_shards(), 0);
    assert_eq!(refcount(e, &data), None);

    // Second run finds nothing
    assert!(e.run_gc(false).await.is_noop());

    let uploads = c.events.events_of_type("ObjectUploaded");
    assert_eq!(uploads.len(), 2);
    assert_eq!(c.events.events_of_type("ObjectDeleted").len(), 2);
    assert_eq!(c.events.events_of_type("ContentReclaimed").len(), 1);
}

#[tokio::test]
async fn test_download_specific_version() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("docs", true, None).await.unwrap();

    let v1 = e.upload("docs", "readme", &b"first draft"[..]).await.unwrap();
    let v2 = e.upload("docs", "readme", &b"second draft"[..]).await.unwrap();
    assert_ne!(v1, v2);

    assert_eq!(e.download("docs", "readme", None).await.unwrap(), &b"second draft"[..]);
    assert_eq!(e.download("docs", "readme", Some(v1.as_str())).await.unwrap(), &b"first draft"[..]);

    // Deleting the latest promotes the previous version
    e.delete("docs", "readme", Some(v2.as_str())).await.unwrap();
    assert_eq!(e.download("docs", "readme", None).await.unwrap(), &b"first draft"[..]);

    assert_matches!(
        e.download("docs", "readme", Some(v2.as_str())).await,
        Err(Error::VersionNotFound { .. })
    );
    assert_matches!(
        e.download("docs", "missing", None).await,
        Err(Error::ObjectNotFound { .. })
    );
}

#[tokio::test]
async fn test_unversioned_overwrite_is_reclaimed() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("scratch", false, None).await.unwrap();

    e.upload("scratch", "k", &b"old contents"[..]).await.unwrap();
    let receipt = e
        .upload_with("scratch", "k", Bytes::from_static(b"new"), UploadOptions::default())
        .await
        .unwrap();
    assert!(receipt.superseded.is_some());
    assert_eq!(e.list_versions("scratch", "k").await.unwrap().len(), 1);

    let usage = e.quota_usage("scratch").await.unwrap();
    assert_eq!(usage.used_bytes, 3);
    assert_eq!(usage.used_objects, 1);

    assert_eq!(e.run_gc(false).await.entries_reclaimed, 1);
    assert_eq!(c.transport.total_shards(), 6);
    assert_eq!(e.download("scratch", "k", None).await.unwrap(), &b"new"[..]);
}

#[tokio::test]
async fn test_bucket_management() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    assert_matches!(
        e.create_bucket("b1", true, None).await,
        Err(Error::BucketAlreadyExists(_))
    );
    assert_matches!(
        e.upload("nope", "k", &b"x"[..]).await,
        Err(Error::BucketNotFound(_))
    );

    let v = e.upload("b1", "k", &b"x"[..]).await.unwrap();
    assert_matches!(e.delete_bucket("b1").await, Err(Error::BucketNotEmpty { .. }));

    let bucket = e.set_versioning("b1", false).unwrap();
    assert!(!bucket.versioning_enabled);

    e.delete("b1", "k", Some(v.as_str())).await.unwrap();
    e.delete_bucket("b1").await.unwrap();
    assert!(e.list_buckets().is_empty());
    assert_matches!(e.quota_usage("b1").await, Err(Error::BucketNotFound(_)));
}

// =============================================================================
// Quota
// =============================================================================

#[tokio::test]
async fn test_quota_rejection_leaves_no_residue() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("tiny", true, Some(Quota::new(100, 10))).await.unwrap();

    assert_matches!(
        e.upload("tiny", "big", payload(101, 1)).await,
        Err(Error::QuotaExceeded { .. })
    );
    assert_eq!(c.transport.total_puts(), 0);
    assert!(e.content_store().is_empty());
    assert!(e.list_objects("tiny").await.unwrap().is_empty());
    assert_eq!(e.quota_usage("tiny").await.unwrap().used_bytes, 0);

    // Object count limit
    e.set_quota("tiny", Quota::new(100, 1)).await.unwrap();
    e.upload("tiny", "one", &b"1"[..]).await.unwrap();
    assert_matches!(
        e.upload("tiny", "two", &b"2"[..]).await,
        Err(Error::QuotaExceeded { .. })
    );
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_same_key() {
    let c = cluster(8);
    c.engine.create_bucket("hot", true, Some(Quota::unlimited())).await.unwrap();

    let tasks: Vec<_> = (0..20u8)
        .map(|i| {
            let engine = c.engine.clone();
            tokio::spawn(async move { engine.upload("hot", "key", payload(64, i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let versions = c.engine.list_versions("hot", "key").await.unwrap();
    assert_eq!(versions.len(), 20);
    assert_eq!(versions.iter().filter(|v| v.is_latest).count(), 1);
    assert!(versions[0].is_latest);

    let latest = c.engine.download("hot", "key", None).await.unwrap();
    assert_eq!(ContentHash::of(&latest), versions[0].content_hash);
    c.engine.ledger().verify().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_content_writes_once() {
    let c = cluster(6);
    c.engine.create_bucket("b1", true, None).await.unwrap();
    let data = payload(4096, 9);

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let engine = c.engine.clone();
            let data = Bytes::from(data.clone());
            tokio::spawn(async move {
                engine
                    .upload_with("b1", &format!("copy-{}", i), data, UploadOptions::default())
                    .await
            })
        })
        .collect();

    let mut stored = 0;
    for task in tasks {
        if !task.await.unwrap().unwrap().deduplicated {
            stored += 1;
        }
    }

    assert_eq!(stored, 1);
    assert_eq!(c.transport.total_puts(), 6);
    assert_eq!(refcount(&c.engine, &data), Some(10));
    assert_eq!(c.engine.dedup_stats().unique_contents, 1);
}

// =============================================================================
// Node Failures
// =============================================================================

#[tokio::test]
async fn test_reads_survive_two_node_failures() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    let data = payload(10_000, 3);
    e.upload("b1", "k", data.clone()).await.unwrap();

    c.transport.set_down(&NodeId::new("node2"), true);
    c.transport.set_down(&NodeId::new("node5"), true);
    assert_eq!(e.download("b1", "k", None).await.unwrap(), data);

    c.transport.set_down(&NodeId::new("node6"), true);
    assert_matches!(
        e.download("b1", "k", None).await,
        Err(Error::ReconstructionImpossible {
            available: 3,
            required: 4
        })
    );
    assert_eq!(c.events.events_of_type("ReconstructionFailed").len(), 1);
    assert_eq!(e.metrics().reconstruction_failures_total.get(), 1);
}

#[tokio::test]
async fn test_read_skips_corrupt_shard() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    let data = payload(777, 5);
    e.upload("b1", "k", data.clone()).await.unwrap();

    let entry = e.content_store().find(&ContentHash::of(&data)).unwrap();
    let first = entry.shard_set.get(0).unwrap();
    assert!(c.transport.corrupt(&first.node_id, &first.shard_id));

    assert_eq!(e.download("b1", "k", None).await.unwrap(), data);
}

#[tokio::test]
async fn test_placement_failure_rolls_back() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    c.transport.fail_writes(&NodeId::new("node4"), true);

    assert_matches!(
        e.upload("b1", "k", &b"cannot place"[..]).await,
        Err(Error::PlacementFailed { .. })
    );
    assert_eq!(c.transport.total_shards(), 0);
    assert!(e.content_store().is_empty());
    assert!(e.list_objects("b1").await.unwrap().is_empty());
    assert_eq!(e.quota_usage("b1").await.unwrap().used_objects, 0);
    assert_eq!(c.events.events_of_type("PlacementFailed").len(), 1);
}

#[tokio::test]
async fn test_placement_retries_on_spare_node() {
    let c = cluster(7);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    c.transport.fail_writes(&NodeId::new("node1"), true);

    e.upload("b1", "k", &b"seven nodes, one broken"[..]).await.unwrap();
    assert_eq!(c.transport.shard_count(&NodeId::new("node1")), 0);
    assert_eq!(c.transport.total_shards(), 6);
}

// =============================================================================
// GC
// =============================================================================

#[tokio::test]
async fn test_orphan_sweep_removes_stray_shards() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    e.upload("b1", "k", &b"live"[..]).await.unwrap();

    let stray = ShardId::new("0123abcd-2-crashed").unwrap();
    c.transport.insert_raw(
        &NodeId::new("node3"),
        stray.clone(),
        StoredShard::seal(Bytes::from_static(b"junk")),
    );

    assert_eq!(e.run_gc(false).await.orphans_deleted, 0);
    let report = e.run_gc(true).await;
    assert_eq!(report.orphans_deleted, 1);
    assert!(!c.transport.contains(&NodeId::new("node3"), &stray));
    assert_eq!(e.download("b1", "k", None).await.unwrap(), &b"live"[..]);

    let status = e.gc().status();
    assert_eq!(status.runs, 2);
    assert_eq!(status.total_orphans_deleted, 1);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_metadata_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.json");
    let transport = Arc::new(InMemoryShardTransport::new());

    let first = cluster_with(6, transport.clone());
    first.engine.create_bucket("b1", true, None).await.unwrap();
    let v1 = first.engine.upload("b1", "k", &b"one"[..]).await.unwrap();
    first.engine.upload("b1", "k", &b"two"[..]).await.unwrap();
    first.engine.upload("b1", "other", &b"two"[..]).await.unwrap();
    first.engine.save_metadata(&path).await.unwrap();

    let second = cluster_with(6, transport);
    assert!(second.engine.load_metadata(&path).await.unwrap());

    let e = &second.engine;
    assert_eq!(e.download("b1", "k", None).await.unwrap(), &b"two"[..]);
    assert_eq!(e.download("b1", "k", Some(v1.as_str())).await.unwrap(), &b"one"[..]);
    assert_eq!(refcount(e, b"two"), Some(2));

    let usage = e.quota_usage("b1").await.unwrap();
    assert_eq!(usage.used_bytes, 9);
    assert_eq!(usage.used_objects, 3);
    e.ledger().verify().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_saved_during_delete_and_gc_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryShardTransport::new());
    let c = cluster_with(6, transport.clone());
    c.engine.create_bucket("b1", true, None).await.unwrap();
    for i in 0..16u8 {
        c.engine
            .upload("b1", &format!("key-{}", i), payload(64, i))
            .await
            .unwrap();
    }

    let engine = c.engine.clone();
    let churn = tokio::spawn(async move {
        for i in 0..16u8 {
            engine.delete("b1", &format!("key-{}", i), None).await.unwrap();
            engine.run_gc(false).await;
        }
    });

    let mut round = 0;
    loop {
        let finished = churn.is_finished();
        let path = dir.path().join(format!("metadata-{}.json", round));
        c.engine.save_metadata(&path).await.unwrap();

        let reloaded = cluster_with(6, transport.clone());
        assert!(reloaded.engine.load_metadata(&path).await.unwrap());
        reloaded.engine.ledger().verify().await.unwrap();

        round += 1;
        if finished {
            break;
        }
    }
    churn.await.unwrap();
    assert!(c.engine.list_objects("b1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_metadata_file_is_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    let c = cluster(6);
    assert!(!c
        .engine
        .load_metadata(dir.path().join("absent.json"))
        .await
        .unwrap());
    assert!(c.engine.list_buckets().is_empty());
}

// =============================================================================
// Observability
// =============================================================================

#[tokio::test]
async fn test_metrics_and_stats() {
    let c = cluster(6);
    let e = &c.engine;
    e.create_bucket("b1", true, None).await.unwrap();
    let data = payload(1000, 2);
    e.upload("b1", "a", data.clone()).await.unwrap();
    e.upload("b1", "b", data.clone()).await.unwrap();
    e.download("b1", "a", None).await.unwrap();

    let text = e.metrics().encode().unwrap();
    assert!(text.contains("shardvault_uploads_total{outcome=\"stored\"} 1"));
    assert!(text.contains("shardvault_uploads_total{outcome=\"deduplicated\"} 1"));
    assert!(text.contains("shardvault_downloads_total 1"));

    let stats = e.stats();
    assert_eq!(stats.buckets, 1);
    assert_eq!(stats.nodes.up, 6);
    assert_eq!(stats.dedup.unique_contents, 1);
    assert_eq!(stats.dedup.total_references, 2);
    assert_eq!(stats.dedup.logical_bytes, 2000);
    assert!((stats.dedup.savings_percent - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_health_check_marks_down_nodes() {
    let c = cluster(6);
    c.transport.set_down(&NodeId::new("node1"), true);

    let changes = c.engine.health_monitor().check_once().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(c.engine.stats().nodes.down, 1);

    // Five usable nodes cannot take six shards
    c.engine.create_bucket("b1", true, None).await.unwrap();
    assert_matches!(
        c.engine.upload("b1", "k", &b"x"[..]).await,
        Err(Error::PlacementFailed { .. })
    );
    assert_eq!(c.transport.total_puts(), 0);
}
