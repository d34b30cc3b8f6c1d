//! Metadata snapshot persistence.
//!
//! Buckets, versions and content entries serialised as one JSON document.
//! Saving writes a sibling temp file and renames it over the target, so a
//! crash mid-save leaves the previous snapshot intact.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::content_store::ContentEntry;
use super::ledger::{Bucket, Version};
use crate::domain::ports::ContentHash;
use crate::error::{Error, Result};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything needed to rebuild an engine's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub format_version: u32,
    pub taken_at: DateTime<Utc>,
    pub buckets: Vec<Bucket>,
    pub versions: Vec<Version>,
    pub contents: Vec<ContentEntry>,
}

impl MetadataSnapshot {
    pub fn new(buckets: Vec<Bucket>, versions: Vec<Version>, contents: Vec<ContentEntry>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            taken_at: Utc::now(),
            buckets,
            versions,
            contents,
        }
    }

    /// Write the snapshot atomically.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(
            path = %path.display(),
            buckets = self.buckets.len(),
            versions = self.versions.len(),
            contents = self.contents.len(),
            "metadata snapshot saved"
        );
        Ok(())
    }

    /// Read a snapshot, or `None` when the file does not exist yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let json = match tokio::fs::read(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Self = serde_json::from_slice(&json)?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::Config(format!(
                "unsupported snapshot format {} in {}",
                snapshot.format_version,
                path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    /// Content entries with refcounts recomputed from the versions.
    ///
    /// Entries no version references come back at refcount zero so the next
    /// GC run reclaims them. A version pointing at a missing entry is an error.
    pub fn reconciled_contents(&self) -> Result<Vec<ContentEntry>> {
        let mut counts: HashMap<&ContentHash, u64> = HashMap::new();
        for version in &self.versions {
            *counts.entry(&version.content_hash).or_default() += 1;
        }

        let mut contents = self.contents.clone();
        for entry in &mut contents {
            let live = counts.remove(&entry.content_hash).unwrap_or(0);
            if live != entry.refcount {
                warn!(
                    hash = %entry.content_hash.short(),
                    recorded = entry.refcount,
                    live,
                    "refcount corrected on restore"
                );
                entry.refcount = live;
            }
        }

        if let Some(missing) = counts.keys().next() {
            return Err(Error::ContentNotFound(missing.to_string()));
        }
        Ok(contents)
    }
}
