//! Metadata Ledger
//!
//! Buckets, versions, and the latest-version pointer of every key.
//!
//! Commits to one `(bucket, key)` are serialized by that key's async mutex;
//! different keys proceed independently. Every commit takes a number from a
//! global sequence while holding the key lock, so the order in which versions
//! of a key became latest is the order of their sequence numbers.
//!
//! Bucket deletion excludes commits through a per-bucket gate: commits hold it
//! shared, `delete_bucket` exclusively.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::content_store::ContentStore;
use crate::domain::ports::{ContentHash, Quota, QuotaManager};
use crate::error::{Error, Result};

// =============================================================================
// Rows
// =============================================================================

/// A bucket and its settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub versioning_enabled: bool,
    pub quota: Quota,
    pub created_at: DateTime<Utc>,
}

/// One committed version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
    /// Position in the global commit order
    pub commit_seq: u64,
}

/// Listing row for the request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub key: String,
    pub version_id: String,
    pub size_bytes: u64,
    pub content_hash: ContentHash,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Version> for VersionSummary {
    fn from(v: &Version) -> Self {
        Self {
            key: v.key.clone(),
            version_id: v.version_id.clone(),
            size_bytes: v.size_bytes,
            content_hash: v.content_hash.clone(),
            is_latest: v.is_latest,
            created_at: v.created_at,
        }
    }
}

/// Outcome of `commit_version`.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub version: Version,
    /// Version removed in the same commit (versioning disabled)
    pub superseded: Option<Version>,
    /// Refcount of the superseded version's content after release
    pub superseded_refcount: Option<u64>,
}

/// Outcome of deleting one version.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub version: Version,
    /// Refcount of the deleted version's content after release
    pub refcount_after: u64,
    /// Version promoted to latest, if any
    pub promoted: Option<String>,
}

/// Noncurrent-version retention rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_noncurrent_versions: usize,
    /// Zero disables age-based expiry
    pub noncurrent_retention_days: u64,
}

// =============================================================================
// Internal State
// =============================================================================

/// All versions of one key, oldest first.
#[derive(Debug, Default)]
struct KeyVersions {
    versions: Vec<Version>,
}

impl KeyVersions {
    fn latest_index(&self) -> Option<usize> {
        self.versions.iter().rposition(|v| v.is_latest)
    }

    fn position(&self, version_id: &str) -> Option<usize> {
        self.versions.iter().position(|v| v.version_id == version_id)
    }

    fn check(&self, bucket: &str, key: &str) -> Result<()> {
        let latest = self.versions.iter().filter(|v| v.is_latest).count();
        if latest > 1 {
            return Err(Error::InvariantViolation(format!(
                "{}/{} has {} latest versions",
                bucket, key, latest
            )));
        }
        if let Some(idx) = self.latest_index() {
            if idx + 1 != self.versions.len() {
                return Err(Error::InvariantViolation(format!(
                    "{}/{} latest version is not the most recent commit",
                    bucket, key
                )));
            }
        }
        if self
            .versions
            .windows(2)
            .any(|w| w[0].commit_seq >= w[1].commit_seq)
        {
            return Err(Error::InvariantViolation(format!(
                "{}/{} versions out of commit order",
                bucket, key
            )));
        }
        Ok(())
    }
}

type KeySlot = Arc<Mutex<KeyVersions>>;

#[derive(Debug)]
struct BucketState {
    info: RwLock<Bucket>,
    gate: AsyncRwLock<()>,
    keys: DashMap<String, KeySlot>,
}

impl BucketState {
    fn key_slot(&self, key: &str) -> KeySlot {
        self.keys.entry(key.to_string()).or_default().clone()
    }

    fn existing_slot(&self, key: &str) -> Option<KeySlot> {
        self.keys.get(key).map(|slot| slot.clone())
    }

    /// Forget an empty key slot nobody else holds.
    fn prune_key(&self, key: &str) {
        self.keys.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map(|kv| kv.versions.is_empty())
                    .unwrap_or(false)
        });
    }

    fn sorted_slots(&self) -> Vec<(String, KeySlot)> {
        let mut slots: Vec<(String, KeySlot)> = self
            .keys
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Owner of buckets, versions and the latest pointer.
pub struct Ledger {
    buckets: DashMap<String, Arc<BucketState>>,
    commit_seq: AtomicU64,
    content: Arc<ContentStore>,
    quota: Arc<dyn QuotaManager>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("buckets", &self.buckets.len())
            .field("commit_seq", &self.commit_seq.load(Ordering::SeqCst))
            .finish()
    }
}

impl Ledger {
    pub fn new(content: Arc<ContentStore>, quota: Arc<dyn QuotaManager>) -> Self {
        Self {
            buckets: DashMap::new(),
            commit_seq: AtomicU64::new(0),
            content,
            quota,
        }
    }

    fn bucket_state(&self, bucket: &str) -> Result<Arc<BucketState>> {
        self.buckets
            .get(bucket)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    /// Create an empty bucket.
    pub async fn create_bucket(&self, name: &str, versioning_enabled: bool, quota: Quota) -> Result<Bucket> {
        validate_bucket_name(name)?;

        let bucket = Bucket {
            name: name.to_string(),
            versioning_enabled,
            quota,
            created_at: Utc::now(),
        };

        match self.buckets.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::BucketAlreadyExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(BucketState {
                    info: RwLock::new(bucket.clone()),
                    gate: AsyncRwLock::new(()),
                    keys: DashMap::new(),
                }));
            }
        }
        self.quota.set_quota(name, quota).await;

        info!(bucket = name, versioning_enabled, "bucket created");
        Ok(bucket)
    }

    /// Delete a bucket that holds no versions.
    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        let state = self.bucket_state(name)?;
        let _exclusive = state.gate.write().await;

        let mut versions = 0;
        for (_, slot) in state.sorted_slots() {
            versions += slot.lock().await.versions.len();
        }
        if versions > 0 {
            return Err(Error::BucketNotEmpty {
                bucket: name.to_string(),
                versions,
            });
        }

        self.buckets.remove(name);
        self.quota.remove_bucket(name).await;
        info!(bucket = name, "bucket deleted");
        Ok(())
    }

    pub fn bucket(&self, name: &str) -> Result<Bucket> {
        Ok(self.bucket_state(name)?.info.read().clone())
    }

    pub fn list_buckets(&self) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = self
            .buckets
            .iter()
            .map(|b| b.info.read().clone())
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        buckets
    }

    /// Enable or suspend versioning. Existing versions are kept either way.
    pub fn set_versioning(&self, name: &str, enabled: bool) -> Result<Bucket> {
        let state = self.bucket_state(name)?;
        let mut info = state.info.write();
        info.versioning_enabled = enabled;
        Ok(info.clone())
    }

    pub async fn set_quota(&self, name: &str, quota: Quota) -> Result<Bucket> {
        let state = self.bucket_state(name)?;
        let bucket = {
            let mut info = state.info.write();
            info.quota = quota;
            info.clone()
        };
        self.quota.set_quota(name, quota).await;
        Ok(bucket)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Check, without reserving, that committing `size` bytes would fit.
    pub async fn preflight(&self, bucket: &str, key: &str, size: u64) -> Result<()> {
        let state = self.bucket_state(bucket)?;
        let versioning = state.info.read().versioning_enabled;

        let (bytes, objects) = match (versioning, state.existing_slot(key)) {
            (false, Some(slot)) => {
                let kv = slot.lock().await;
                match kv.latest_index() {
                    Some(idx) => (size.saturating_sub(kv.versions[idx].size_bytes), 0),
                    None => (size, 1),
                }
            }
            _ => (size, 1),
        };
        self.quota.check(bucket, bytes, objects).await
    }

    /// Commit a new latest version of `key`.
    ///
    /// The content must already be referenced by the caller. Quota rejection
    /// leaves the ledger unchanged.
    #[instrument(skip(self, content_hash), fields(hash = %content_hash.short()))]
    pub async fn commit_version(
        &self,
        bucket: &str,
        key: &str,
        content_hash: &ContentHash,
        size: u64,
    ) -> Result<CommitOutcome> {
        validate_key(key)?;
        let state = self.bucket_state(bucket)?;
        let _shared = state.gate.read().await;
        // The bucket may have been deleted (and re-created) while we waited
        match self.buckets.get(bucket) {
            Some(current) if Arc::ptr_eq(current.value(), &state) => {}
            _ => return Err(Error::BucketNotFound(bucket.to_string())),
        }
        let versioning = state.info.read().versioning_enabled;

        let slot = state.key_slot(key);
        let mut kv = slot.lock().await;
        let prior = kv.latest_index();

        let superseded = if versioning {
            self.quota.check_and_reserve(bucket, size, 1).await?;
            if let Some(idx) = prior {
                kv.versions[idx].is_latest = false;
            }
            None
        } else {
            let prior_size = prior.map(|idx| kv.versions[idx].size_bytes);
            let objects = if prior.is_some() { 0 } else { 1 };
            let grow = size.saturating_sub(prior_size.unwrap_or(0));
            self.quota.check_and_reserve(bucket, grow, objects).await?;
            if let Some(prior_size) = prior_size {
                let shrink = prior_size.saturating_sub(size);
                if shrink > 0 {
                    self.quota.release(bucket, shrink, 0).await;
                }
            }
            prior.map(|idx| kv.versions.remove(idx))
        };

        let commit_seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let version = Version {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id: Uuid::new_v4().to_string(),
            content_hash: content_hash.clone(),
            size_bytes: size,
            is_latest: true,
            created_at: Utc::now(),
            commit_seq,
        };
        kv.versions.push(version.clone());

        if let Err(e) = kv.check(bucket, key) {
            error!("{}", e);
            return Err(e);
        }
        drop(kv);

        let superseded_refcount = match &superseded {
            Some(old) => Some(self.content.release(&old.content_hash).await?),
            None => None,
        };

        debug!(
            version_id = %version.version_id,
            commit_seq,
            superseded = superseded.is_some(),
            "version committed"
        );
        Ok(CommitOutcome {
            version,
            superseded,
            superseded_refcount,
        })
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete one version, releasing its content reference and quota.
    #[instrument(skip(self))]
    pub async fn delete_version(&self, bucket: &str, key: &str, version_id: &str) -> Result<DeleteOutcome> {
        let state = self.bucket_state(bucket)?;
        let not_found = || Error::VersionNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id: version_id.to_string(),
        };

        let slot = state.existing_slot(key).ok_or_else(not_found)?;
        let mut kv = slot.lock().await;
        let pos = kv.position(version_id).ok_or_else(not_found)?;
        let outcome = self.remove_locked(&state, &mut kv, pos).await;
        drop(kv);
        drop(slot);
        state.prune_key(key);
        outcome
    }

    /// Delete the latest version of a key.
    pub async fn delete_latest(&self, bucket: &str, key: &str) -> Result<DeleteOutcome> {
        let state = self.bucket_state(bucket)?;
        let not_found = || Error::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        let slot = state.existing_slot(key).ok_or_else(not_found)?;
        let mut kv = slot.lock().await;
        let pos = kv.latest_index().ok_or_else(not_found)?;
        let outcome = self.remove_locked(&state, &mut kv, pos).await;
        drop(kv);
        drop(slot);
        state.prune_key(key);
        outcome
    }

    async fn remove_locked(
        &self,
        state: &BucketState,
        kv: &mut KeyVersions,
        pos: usize,
    ) -> Result<DeleteOutcome> {
        let versioning = state.info.read().versioning_enabled;
        let removed = kv.versions.remove(pos);

        let mut promoted = None;
        if removed.is_latest && versioning {
            if let Some(next) = kv.versions.last_mut() {
                next.is_latest = true;
                promoted = Some(next.version_id.clone());
            }
        }

        self.quota
            .release(&removed.bucket, removed.size_bytes, 1)
            .await;
        let refcount_after = self.content.release(&removed.content_hash).await?;

        debug!(
            version_id = %removed.version_id,
            refcount_after,
            promoted = ?promoted,
            "version deleted"
        );
        Ok(DeleteOutcome {
            version: removed,
            refcount_after,
            promoted,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Resolve a specific version, or the latest one.
    pub async fn resolve(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Result<Version> {
        let state = self.bucket_state(bucket)?;
        let object_missing = || Error::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        let slot = state.existing_slot(key).ok_or_else(object_missing)?;
        let kv = slot.lock().await;
        match version_id {
            None => kv
                .latest_index()
                .map(|idx| kv.versions[idx].clone())
                .ok_or_else(object_missing),
            Some(id) => kv
                .position(id)
                .map(|idx| kv.versions[idx].clone())
                .ok_or_else(|| Error::VersionNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    version_id: id.to_string(),
                }),
        }
    }

    /// Latest version of every key, sorted by key.
    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<VersionSummary>> {
        let state = self.bucket_state(bucket)?;
        let mut out = Vec::new();
        for (_, slot) in state.sorted_slots() {
            let kv = slot.lock().await;
            if let Some(idx) = kv.latest_index() {
                out.push(VersionSummary::from(&kv.versions[idx]));
            }
        }
        Ok(out)
    }

    /// Every version of a key, newest first.
    pub async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<VersionSummary>> {
        let state = self.bucket_state(bucket)?;
        let Some(slot) = state.existing_slot(key) else {
            return Ok(Vec::new());
        };
        let kv = slot.lock().await;
        Ok(kv.versions.iter().rev().map(VersionSummary::from).collect())
    }

    /// Every bucket and every version, read in one pass.
    ///
    /// Each returned version belongs to a returned bucket, so the pair can
    /// always be fed back into [`Ledger::restore`].
    pub async fn export(&self) -> (Vec<Bucket>, Vec<Version>) {
        let mut states: Vec<(String, Arc<BucketState>)> = self
            .buckets
            .iter()
            .map(|b| (b.key().clone(), b.value().clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buckets = Vec::with_capacity(states.len());
        let mut versions = Vec::new();
        for (_, state) in states {
            buckets.push(state.info.read().clone());
            for (_, slot) in state.sorted_slots() {
                versions.extend(slot.lock().await.versions.iter().cloned());
            }
        }
        (buckets, versions)
    }

    /// Every version in the ledger, grouped by bucket and key.
    pub async fn all_versions(&self) -> Vec<Version> {
        self.export().await.1
    }

    /// Verify per-key invariants across the whole ledger.
    pub async fn verify(&self) -> Result<()> {
        for bucket in self.list_buckets() {
            let state = self.bucket_state(&bucket.name)?;
            for (key, slot) in state.sorted_slots() {
                slot.lock().await.check(&bucket.name, &key)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Expire noncurrent versions beyond the policy. The latest is never touched.
    pub async fn expire_noncurrent(&self, policy: RetentionPolicy, now: DateTime<Utc>) -> Vec<DeleteOutcome> {
        let cutoff = (policy.noncurrent_retention_days > 0)
            .then(|| now - ChronoDuration::days(policy.noncurrent_retention_days as i64));
        let mut expired = Vec::new();

        for bucket in self.list_buckets() {
            let Ok(state) = self.bucket_state(&bucket.name) else {
                continue;
            };
            for (key, slot) in state.sorted_slots() {
                let mut kv = slot.lock().await;

                // Noncurrent versions, newest first
                let victims: Vec<String> = kv
                    .versions
                    .iter()
                    .rev()
                    .filter(|v| !v.is_latest)
                    .enumerate()
                    .filter(|(rank, v)| {
                        *rank >= policy.max_noncurrent_versions
                            || cutoff.map(|c| v.created_at < c).unwrap_or(false)
                    })
                    .map(|(_, v)| v.version_id.clone())
                    .collect();

                for version_id in victims {
                    let Some(pos) = kv.position(&version_id) else {
                        continue;
                    };
                    match self.remove_locked(&state, &mut kv, pos).await {
                        Ok(outcome) => expired.push(outcome),
                        Err(e) => warn!(bucket = %bucket.name, key = %key, "expiry failed: {}", e),
                    }
                }
                drop(kv);
                drop(slot);
                state.prune_key(&key);
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "noncurrent versions expired");
        }
        expired
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Replace the ledger contents. Quota usage is rebuilt from the versions.
    pub async fn restore(&self, buckets: Vec<Bucket>, versions: Vec<Version>) -> Result<()> {
        self.buckets.clear();
        let mut max_seq = 0;

        for bucket in buckets {
            self.buckets.insert(
                bucket.name.clone(),
                Arc::new(BucketState {
                    info: RwLock::new(bucket.clone()),
                    gate: AsyncRwLock::new(()),
                    keys: DashMap::new(),
                }),
            );
        }

        let mut sorted = versions;
        sorted.sort_by_key(|v| v.commit_seq);
        for version in sorted {
            let state = self.bucket_state(&version.bucket)?;
            max_seq = max_seq.max(version.commit_seq);
            let slot = state.key_slot(&version.key);
            let mut kv = slot.lock().await;
            kv.versions.push(version);
        }

        for bucket in self.list_buckets() {
            let state = self.bucket_state(&bucket.name)?;
            let (mut bytes, mut objects) = (0u64, 0u64);
            for (key, slot) in state.sorted_slots() {
                let kv = slot.lock().await;
                kv.check(&bucket.name, &key)?;
                bytes += kv.versions.iter().map(|v| v.size_bytes).sum::<u64>();
                objects += kv.versions.len() as u64;
            }
            self.quota
                .restore_usage(&bucket.name, bucket.quota, bytes, objects)
                .await;
        }

        self.commit_seq.store(max_seq, Ordering::SeqCst);
        Ok(())
    }
}

fn validate_bucket_name(name: &str) -> Result<()> {
    let valid = (1..=63).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.']);
    if !valid {
        return Err(Error::InvalidName(format!("bucket '{}'", name)));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 1024 {
        return Err(Error::InvalidName(format!("object key '{}'", key)));
    }
    Ok(())
}
