//! Bucket Quota Adapter
//!
//! In-process implementation of the `QuotaManager` port. Each bucket's usage
//! sits behind its own mutex so check-and-reserve is atomic per bucket.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::domain::ports::{Quota, QuotaManager, QuotaUsage};
use crate::error::{Error, Result};

/// Per-bucket byte and object accounting.
#[derive(Debug, Default)]
pub struct BucketQuotaManager {
    buckets: DashMap<String, Arc<Mutex<QuotaUsage>>>,
}

impl BucketQuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, bucket: &str) -> Result<Arc<Mutex<QuotaUsage>>> {
        self.buckets
            .get(bucket)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))
    }
}

fn admit(bucket: &str, usage: &QuotaUsage, bytes: u64, objects: u64) -> Result<()> {
    let new_bytes = usage.used_bytes.saturating_add(bytes);
    if new_bytes > usage.quota.max_size_bytes {
        return Err(Error::QuotaExceeded {
            bucket: bucket.to_string(),
            reason: format!(
                "{} bytes would exceed limit of {} ({} used)",
                bytes, usage.quota.max_size_bytes, usage.used_bytes
            ),
        });
    }
    let new_objects = usage.used_objects.saturating_add(objects);
    if new_objects > usage.quota.max_objects {
        return Err(Error::QuotaExceeded {
            bucket: bucket.to_string(),
            reason: format!(
                "{} objects would exceed limit of {} ({} used)",
                objects, usage.quota.max_objects, usage.used_objects
            ),
        });
    }
    Ok(())
}

#[async_trait]
impl QuotaManager for BucketQuotaManager {
    async fn set_quota(&self, bucket: &str, quota: Quota) {
        match self.buckets.get(bucket) {
            Some(slot) => slot.lock().quota = quota,
            None => {
                self.buckets.insert(
                    bucket.to_string(),
                    Arc::new(Mutex::new(QuotaUsage {
                        used_bytes: 0,
                        used_objects: 0,
                        quota,
                    })),
                );
            }
        }
    }

    async fn remove_bucket(&self, bucket: &str) {
        self.buckets.remove(bucket);
    }

    async fn check(&self, bucket: &str, additional_bytes: u64, additional_objects: u64) -> Result<()> {
        let slot = self.slot(bucket)?;
        let usage = slot.lock();
        admit(bucket, &usage, additional_bytes, additional_objects)
    }

    async fn check_and_reserve(
        &self,
        bucket: &str,
        additional_bytes: u64,
        additional_objects: u64,
    ) -> Result<()> {
        let slot = self.slot(bucket)?;
        let mut usage = slot.lock();
        admit(bucket, &usage, additional_bytes, additional_objects)?;

        usage.used_bytes += additional_bytes;
        usage.used_objects += additional_objects;
        debug!(
            bucket,
            used_bytes = usage.used_bytes,
            used_objects = usage.used_objects,
            "quota reserved"
        );
        Ok(())
    }

    async fn release(&self, bucket: &str, bytes: u64, objects: u64) {
        if let Some(slot) = self.buckets.get(bucket) {
            let mut usage = slot.lock();
            usage.used_bytes = usage.used_bytes.saturating_sub(bytes);
            usage.used_objects = usage.used_objects.saturating_sub(objects);
        }
    }

    async fn usage(&self, bucket: &str) -> Option<QuotaUsage> {
        self.buckets.get(bucket).map(|slot| *slot.lock())
    }

    async fn restore_usage(&self, bucket: &str, quota: Quota, used_bytes: u64, used_objects: u64) {
        self.buckets.insert(
            bucket.to_string(),
            Arc::new(Mutex::new(QuotaUsage {
                used_bytes,
                used_objects,
                quota,
            })),
        );
    }
}
