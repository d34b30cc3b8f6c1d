//! Filesystem shard store.
//!
//! One file per shard, `<dir>/<shard_id>.shard`, holding the CRC32 as four
//! little-endian bytes followed by the raw shard bytes. Writes go to a temp
//! file first and are renamed into place.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::ports::{ShardId, StoredShard};
use crate::error::{Error, Result};

const SHARD_EXT: &str = "shard";
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct FsShardStore {
    dir: PathBuf,
}

impl FsShardStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, shard_id: &ShardId) -> PathBuf {
        self.dir.join(format!("{}.{}", shard_id, SHARD_EXT))
    }

    pub async fn put(&self, shard_id: &ShardId, shard: &StoredShard) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN + shard.data.len());
        buf.extend_from_slice(&shard.checksum.to_le_bytes());
        buf.extend_from_slice(&shard.data);

        let path = self.path(shard_id);
        let tmp = self.dir.join(format!(".{}.tmp", shard_id));
        fs::write(&tmp, &buf).await?;
        fs::rename(&tmp, &path).await?;
        debug!(shard = %shard_id, len = shard.data.len(), "shard written");
        Ok(())
    }

    /// Read a shard as stored. The checksum is returned, not verified.
    pub async fn get(&self, shard_id: &ShardId) -> Result<Option<StoredShard>> {
        let raw = match fs::read(self.path(shard_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.len() < HEADER_LEN {
            return Err(Error::Internal(format!("shard file {} truncated", shard_id)));
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let mut data = Bytes::from(raw);
        let data = data.split_off(HEADER_LEN);
        Ok(Some(StoredShard {
            data,
            checksum: u32::from_le_bytes(header),
        }))
    }

    /// Remove a shard; `false` if it was not there.
    pub async fn delete(&self, shard_id: &ShardId) -> Result<bool> {
        match fs::remove_file(self.path(shard_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every shard id present, sorted.
    pub async fn list(&self) -> Result<Vec<ShardId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match ShardId::new(stem) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(file = %path.display(), "ignoring unexpected file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> ShardId {
        ShardId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsShardStore::open(dir.path().join("shards")).await.unwrap();
        let shard = StoredShard::seal(vec![7u8; 100]);

        store.put(&sid("abc-0-t1"), &shard).await.unwrap();
        assert_eq!(store.get(&sid("abc-0-t1")).await.unwrap(), Some(shard));

        let on_disk = std::fs::read(dir.path().join("shards/abc-0-t1.shard")).unwrap();
        assert_eq!(on_disk.len(), 104);

        assert!(store.delete(&sid("abc-0-t1")).await.unwrap());
        assert!(!store.delete(&sid("abc-0-t1")).await.unwrap());
        assert_eq!(store.get(&sid("abc-0-t1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsShardStore::open(dir.path()).await.unwrap();
        store.put(&sid("b-1-t"), &StoredShard::seal(vec![1u8])).await.unwrap();
        store.put(&sid("a-0-t"), &StoredShard::seal(vec![2u8])).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("bad id.shard"), b"xxxx").unwrap();

        assert_eq!(store.list().await.unwrap(), vec![sid("a-0-t"), sid("b-1-t")]);
    }

    #[tokio::test]
    async fn test_corruption_survives_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsShardStore::open(dir.path()).await.unwrap();
        store.put(&sid("c-2-t"), &StoredShard::seal(vec![9u8; 16])).await.unwrap();

        let path = dir.path().join("c-2-t.shard");
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let shard = store.get(&sid("c-2-t")).await.unwrap().unwrap();
        assert!(shard.verify(2).is_err());
    }
}
