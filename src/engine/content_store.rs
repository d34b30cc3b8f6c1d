//! Content Store
//!
//! The dedup index: content hash -> shard set + reference count. All
//! mutations of one hash are serialized by a per-hash async mutex, which is
//! what guarantees a single physical write per distinct content under
//! concurrent uploads.
//!
//! # Lifecycle
//!
//! ```text
//! create_or_ref ──▶ refcount 1 ──▶ ... ──▶ release ──▶ refcount 0
//!                                                         │
//!                      reclaim (no readers pinned) ◀──────┘
//!                        pending_delete, delete shards, remove entry
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockWriteGuard};
use tracing::{debug, error, instrument};

use crate::domain::ports::{ContentHash, ShardId, ShardSet, DATA_SHARDS, TOTAL_SHARDS};
use crate::ec::calculate_shard_size;
use crate::error::{Error, Result};

// =============================================================================
// Keyed Locks
// =============================================================================

/// Lazily created async mutexes, one per key.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub(crate) async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let slot = self.locks.entry(key.clone()).or_default().clone();
        slot.lock_owned().await
    }

    /// Drop mutexes nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.locks.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

// =============================================================================
// Content Entry
// =============================================================================

/// One unit of physical storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub shard_set: ShardSet,
    /// Number of live versions pointing here
    pub refcount: u64,
    /// Set while the reclaimer is deleting the shards
    #[serde(default)]
    pub pending_delete: bool,
    pub created_at: DateTime<Utc>,
}

impl ContentEntry {
    /// Bytes actually held on nodes (six padded shards).
    pub fn physical_bytes(&self) -> u64 {
        (calculate_shard_size(self.size_bytes as usize, DATA_SHARDS) * TOTAL_SHARDS) as u64
    }
}

/// Result of `create_or_ref`.
#[derive(Debug, Clone)]
pub struct RefOutcome {
    pub entry: ContentEntry,
    /// The content already existed and no shards were written
    pub deduplicated: bool,
}

/// Dedup index statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub unique_contents: u64,
    pub total_references: u64,
    /// Sum of referenced sizes, counting every reference
    pub logical_bytes: u64,
    /// Sum of distinct content sizes
    pub stored_bytes: u64,
    /// Shard bytes on nodes, padding and parity included
    pub physical_bytes: u64,
    pub unreferenced: u64,
    pub savings_percent: f64,
}

// =============================================================================
// Read Pins
// =============================================================================

/// Keeps an entry from being reclaimed while a read is in flight.
#[derive(Debug)]
pub struct ReadPin {
    entry: ContentEntry,
    readers: Arc<DashMap<ContentHash, usize>>,
}

impl ReadPin {
    pub fn entry(&self) -> &ContentEntry {
        &self.entry
    }
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        let hash = &self.entry.content_hash;
        if let Some(mut count) = self.readers.get_mut(hash) {
            *count = count.saturating_sub(1);
        }
        self.readers.remove_if(hash, |_, count| *count == 0);
    }
}

// =============================================================================
// Content Store
// =============================================================================

/// Dedup index with per-hash serialization.
#[derive(Debug)]
pub struct ContentStore {
    entries: DashMap<ContentHash, ContentEntry>,
    locks: KeyedLocks<ContentHash>,
    readers: Arc<DashMap<ContentHash, usize>>,
    /// Reclaims hold this shared; `hold_reclaims` takes it exclusively
    reclaim_fence: RwLock<()>,
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            locks: KeyedLocks::new(),
            readers: Arc::new(DashMap::new()),
            reclaim_fence: RwLock::new(()),
        }
    }

    pub fn find(&self, hash: &ContentHash) -> Option<ContentEntry> {
        self.entries.get(hash).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reference existing content, or insert `shard_set` as a new entry.
    ///
    /// When the entry exists its shard set is kept and `shard_set` discarded.
    pub async fn create_or_ref(
        &self,
        hash: &ContentHash,
        size_bytes: u64,
        shard_set: ShardSet,
    ) -> Result<RefOutcome> {
        self.create_or_ref_with(hash, size_bytes, || async move {
            Ok::<_, Error>((shard_set, ()))
        })
        .await
    }

    /// Reference existing content, or run `write` to place it and insert it.
    ///
    /// `write` runs only when the entry is absent and while the hash lock is
    /// held, so concurrent callers for the same hash never both write. It
    /// returns the shard set plus a guard value that is dropped only after the
    /// entry is visible in the index. If `write` fails nothing is inserted.
    #[instrument(skip_all, fields(hash = %hash.short(), size = size_bytes))]
    pub async fn create_or_ref_with<F, Fut, G>(
        &self,
        hash: &ContentHash,
        size_bytes: u64,
        write: F,
    ) -> Result<RefOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(ShardSet, G)>>,
    {
        let _lock = self.locks.lock(hash).await;

        if let Some(mut existing) = self.entries.get_mut(hash) {
            if existing.size_bytes != size_bytes {
                return Err(Error::InvariantViolation(format!(
                    "content {} recorded with size {} but referenced with size {}",
                    hash, existing.size_bytes, size_bytes
                )));
            }
            existing.refcount += 1;
            debug!(refcount = existing.refcount, "deduplicated");
            return Ok(RefOutcome {
                entry: existing.clone(),
                deduplicated: true,
            });
        }

        let (shard_set, _write_guard) = write().await?;
        let entry = ContentEntry {
            content_hash: hash.clone(),
            size_bytes,
            shard_set,
            refcount: 1,
            pending_delete: false,
            created_at: Utc::now(),
        };
        self.entries.insert(hash.clone(), entry.clone());
        debug!("new content entry");

        Ok(RefOutcome {
            entry,
            deduplicated: false,
        })
    }

    /// Drop one reference and return the remaining count.
    #[instrument(skip_all, fields(hash = %hash.short()))]
    pub async fn release(&self, hash: &ContentHash) -> Result<u64> {
        let _lock = self.locks.lock(hash).await;

        let Some(mut entry) = self.entries.get_mut(hash) else {
            error!("release of unknown content");
            return Err(Error::ContentNotFound(hash.to_string()));
        };
        if entry.refcount == 0 {
            error!("release below zero");
            return Err(Error::RefcountUnderflow(hash.to_string()));
        }
        entry.refcount -= 1;
        debug!(refcount = entry.refcount, "released");
        Ok(entry.refcount)
    }

    /// Pin an entry for reading.
    pub async fn pin(&self, hash: &ContentHash) -> Result<ReadPin> {
        let _lock = self.locks.lock(hash).await;

        let entry = self
            .entries
            .get(hash)
            .map(|e| e.clone())
            .ok_or_else(|| Error::ContentNotFound(hash.to_string()))?;
        *self.readers.entry(hash.clone()).or_insert(0) += 1;

        Ok(ReadPin {
            entry,
            readers: self.readers.clone(),
        })
    }

    pub fn readers(&self, hash: &ContentHash) -> usize {
        self.readers.get(hash).map(|c| *c).unwrap_or(0)
    }

    /// Hashes whose refcount is zero.
    pub fn unreferenced(&self) -> Vec<ContentHash> {
        self.entries
            .iter()
            .filter(|e| e.refcount == 0)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove an unreferenced, unpinned entry after deleting its shards.
    ///
    /// Returns the removed entry and whatever `delete` reported, or `None`
    /// when the entry is gone, referenced again, or being read.
    #[instrument(skip_all, fields(hash = %hash.short()))]
    pub async fn reclaim<F, Fut, T>(&self, hash: &ContentHash, delete: F) -> Option<(ContentEntry, T)>
    where
        F: FnOnce(ShardSet) -> Fut,
        Fut: Future<Output = T>,
    {
        // Fence before the hash lock, never after
        let _fence = self.reclaim_fence.read().await;
        let _lock = self.locks.lock(hash).await;

        let shard_set = {
            let mut entry = self.entries.get_mut(hash)?;
            if entry.refcount > 0 {
                return None;
            }
            if self.readers(hash) > 0 {
                debug!("skipping pinned content");
                return None;
            }
            entry.pending_delete = true;
            entry.shard_set.clone()
        };

        let report = delete(shard_set).await;
        let (_, entry) = self.entries.remove(hash)?;
        debug!("content entry removed");
        Some((entry, report))
    }

    /// Hold off every reclaim until the guard is dropped.
    ///
    /// Waits for reclaims already running. While the guard lives no entry
    /// leaves the index.
    pub async fn hold_reclaims(&self) -> RwLockWriteGuard<'_, ()> {
        self.reclaim_fence.write().await
    }

    /// Every shard id referenced by an entry in the index.
    pub fn live_shard_ids(&self) -> HashSet<ShardId> {
        self.entries
            .iter()
            .flat_map(|e| {
                e.shard_set
                    .iter()
                    .map(|r| r.shard_id.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// All entries, sorted by hash.
    pub fn entries(&self) -> Vec<ContentEntry> {
        let mut entries: Vec<ContentEntry> = self.entries.iter().map(|e| e.clone()).collect();
        entries.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        entries
    }

    /// Replace the whole index.
    pub fn restore(&self, entries: Vec<ContentEntry>) {
        self.entries.clear();
        for mut entry in entries {
            entry.pending_delete = false;
            self.entries.insert(entry.content_hash.clone(), entry);
        }
    }

    /// Release lock slots left behind by finished operations.
    pub fn prune_locks(&self) {
        self.locks.prune();
    }

    pub fn stats(&self) -> DedupStats {
        let mut stats = DedupStats::default();
        for e in self.entries.iter() {
            stats.unique_contents += 1;
            stats.total_references += e.refcount;
            stats.logical_bytes += e.size_bytes * e.refcount;
            stats.stored_bytes += e.size_bytes;
            stats.physical_bytes += e.physical_bytes();
            if e.refcount == 0 {
                stats.unreferenced += 1;
            }
        }
        if stats.logical_bytes > 0 {
            let saved = stats.logical_bytes.saturating_sub(stats.stored_bytes);
            stats.savings_percent = saved as f64 / stats.logical_bytes as f64 * 100.0;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{NodeId, ShardKind, ShardRef};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn shard_set(hash: &ContentHash, tag: &str) -> ShardSet {
        ShardSet::new(
            (0..TOTAL_SHARDS)
                .map(|i| ShardRef {
                    shard_index: i,
                    kind: ShardKind::for_index(i),
                    node_id: NodeId::new(format!("n{}", i)),
                    shard_id: ShardId::for_placement(hash, i, tag),
                })
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_ref() {
        let store = ContentStore::new();
        let hash = ContentHash::of(b"hello");

        let first = store.create_or_ref(&hash, 5, shard_set(&hash, "a")).await.unwrap();
        assert!(!first.deduplicated);
        assert_eq!(first.entry.refcount, 1);

        let second = store.create_or_ref(&hash, 5, shard_set(&hash, "b")).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.entry.refcount, 2);
        // The proposed shard set is discarded
        assert_eq!(second.entry.shard_set, shard_set(&hash, "a"));
    }

    #[tokio::test]
    async fn test_release_and_underflow() {
        let store = ContentStore::new();
        let hash = ContentHash::of(b"x");
        store.create_or_ref(&hash, 1, shard_set(&hash, "a")).await.unwrap();

        assert_eq!(store.release(&hash).await.unwrap(), 0);
        assert_matches!(store.release(&hash).await, Err(Error::RefcountUnderflow(_)));

        let absent = ContentHash::of(b"absent");
        assert_matches!(store.release(&absent).await, Err(Error::ContentNotFound(_)));
    }

    #[tokio::test]
    async fn test_single_writer_under_contention() {
        let store = Arc::new(ContentStore::new());
        let writes = Arc::new(AtomicUsize::new(0));
        let hash = ContentHash::of(b"contended");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let writes = writes.clone();
                let hash = hash.clone();
                tokio::spawn(async move {
                    store
                        .create_or_ref_with(&hash, 9, || async {
                            writes.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, Error>((shard_set(&hash, "w"), ()))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut fresh = 0;
        for task in tasks {
            if !task.await.unwrap().deduplicated {
                fresh += 1;
            }
        }

        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(fresh, 1);
        assert_eq!(store.find(&hash).unwrap().refcount, 16);
    }

    #[tokio::test]
    async fn test_failed_write_inserts_nothing() {
        let store = ContentStore::new();
        let hash = ContentHash::of(b"doomed");

        let result = store
            .create_or_ref_with(&hash, 6, || async {
                Err::<(ShardSet, ()), _>(Error::PlacementFailed {
                    content_hash: "doomed".into(),
                    reason: "test".into(),
                })
            })
            .await;

        assert_matches!(result, Err(Error::PlacementFailed { .. }));
        assert!(store.find(&hash).is_none());
    }

    #[tokio::test]
    async fn test_reclaim_respects_refcount_and_pins() {
        let store = ContentStore::new();
        let hash = ContentHash::of(b"reclaim me");
        store.create_or_ref(&hash, 10, shard_set(&hash, "a")).await.unwrap();

        // Referenced: untouched
        assert!(store.reclaim(&hash, |_| async { 6usize }).await.is_none());

        store.release(&hash).await.unwrap();
        let pin = store.pin(&hash).await.unwrap();
        assert_eq!(store.readers(&hash), 1);
        // Pinned: untouched
        assert!(store.reclaim(&hash, |_| async { 6usize }).await.is_none());
        drop(pin);
        assert_eq!(store.readers(&hash), 0);

        let (entry, deleted) = store.reclaim(&hash, |set| async move { set.len() }).await.unwrap();
        assert_eq!(entry.size_bytes, 10);
        assert_eq!(deleted, 6);
        assert!(store.find(&hash).is_none());

        // Idempotent
        assert!(store.reclaim(&hash, |_| async { 0usize }).await.is_none());
    }

    #[tokio::test]
    async fn test_held_reclaims_keep_entries() {
        let store = Arc::new(ContentStore::new());
        let hash = ContentHash::of(b"held");
        store.create_or_ref(&hash, 4, shard_set(&hash, "a")).await.unwrap();
        store.release(&hash).await.unwrap();

        let fence = store.hold_reclaims().await;
        let reclaimer = {
            let store = store.clone();
            let hash = hash.clone();
            tokio::spawn(async move { store.reclaim(&hash, |_| async { 6usize }).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reclaimer.is_finished());
        assert!(store.find(&hash).is_some());

        drop(fence);
        assert!(reclaimer.await.unwrap());
        assert!(store.find(&hash).is_none());
    }

    #[tokio::test]
    async fn test_live_shard_ids_and_stats() {
        let store = ContentStore::new();
        let a = ContentHash::of(b"aaaa");
        let b = ContentHash::of(b"bbbbbbbb");
        store.create_or_ref(&a, 4, shard_set(&a, "t")).await.unwrap();
        store.create_or_ref(&a, 4, shard_set(&a, "t")).await.unwrap();
        store.create_or_ref(&b, 8, shard_set(&b, "t")).await.unwrap();

        assert_eq!(store.live_shard_ids().len(), 12);

        let stats = store.stats();
        assert_eq!(stats.unique_contents, 2);
        assert_eq!(stats.total_references, 3);
        assert_eq!(stats.logical_bytes, 16);
        assert_eq!(stats.stored_bytes, 12);
        assert_eq!(stats.physical_bytes, 6 + 12);
        assert!((stats.savings_percent - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_prune_locks() {
        let store = ContentStore::new();
        let hash = ContentHash::of(b"p");
        store.create_or_ref(&hash, 1, shard_set(&hash, "a")).await.unwrap();
        assert_eq!(store.locks.len(), 1);
        store.prune_locks();
        assert_eq!(store.locks.len(), 0);
    }
}
