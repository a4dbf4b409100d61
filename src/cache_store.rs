//! Versioned stores for the read-optimised statistics cache.
//!
//! Every entry is stored with a version. A write carrying a version that is not greater than the
//! stored one is rejected, so a slow writer can never replace a newer entry.

use std::path::Path;

use async_trait::async_trait;
use cached::stores::{DiskCache, DiskCacheBuilder};
use cached::{Cached, IOCached, UnboundCache};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::IngestError;
use crate::models::CacheEntry;

/// Keyed cache of statistics entries with monotonic versions
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Store an entry unless the stored version is greater than or equal to `version`.
    ///
    /// Returns false if the write was rejected as stale.
    async fn set(&self, key: &str, entry: &CacheEntry, version: u64) -> Result<bool, IngestError>;

    /// Return the stored entry and its version.
    async fn get(&self, key: &str) -> Result<Option<(CacheEntry, u64)>, IngestError>;
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct VersionedEntry {
    entry: CacheEntry,
    version: u64,
}

/// Cache held in memory
pub struct MemoryCacheStore {
    entries: Mutex<UnboundCache<String, VersionedEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        MemoryCacheStore {
            entries: Mutex::new(UnboundCache::new()),
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn set(&self, key: &str, entry: &CacheEntry, version: u64) -> Result<bool, IngestError> {
        let mut entries = self.entries.lock().await;
        let key = key.to_string();
        if let Some(current) = entries.cache_get(&key) {
            if current.version >= version {
                return Ok(false);
            }
        }
        entries.cache_set(
            key,
            VersionedEntry {
                entry: entry.clone(),
                version,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<(CacheEntry, u64)>, IngestError> {
        Ok(self
            .entries
            .lock()
            .await
            .cache_get(&key.to_string())
            .map(|current| (current.entry.clone(), current.version)))
    }
}

/// Cache persisted on disk
pub struct DiskCacheStore {
    entries: DiskCache<String, VersionedEntry>,
    /// Serialises the version check and write of [CacheStore::set].
    write_lock: Mutex<()>,
}

impl DiskCacheStore {
    /// Open or create a cache in a directory.
    pub fn open(dir: &Path) -> Result<Self, IngestError> {
        let entries = DiskCacheBuilder::new("statistics")
            .set_disk_directory(dir)
            .build()
            .map_err(|err| IngestError::InvalidSettings(format!("statistics cache: {err}")))?;
        Ok(DiskCacheStore {
            entries,
            write_lock: Mutex::new(()),
        })
    }

    fn read(&self, key: &str) -> Result<Option<VersionedEntry>, IngestError> {
        self.entries
            .cache_get(&key.to_string())
            .map_err(|err| IngestError::CacheRead {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn set(&self, key: &str, entry: &CacheEntry, version: u64) -> Result<bool, IngestError> {
        let _guard = self.write_lock.lock().await;
        if let Some(current) = self.read(key)? {
            if current.version >= version {
                return Ok(false);
            }
        }
        let write_error = |reason: String| IngestError::CacheWrite {
            key: key.to_string(),
            reason,
        };
        self.entries
            .cache_set(
                key.to_string(),
                VersionedEntry {
                    entry: entry.clone(),
                    version,
                },
            )
            .map_err(|err| write_error(err.to_string()))?;
        self.entries
            .connection()
            .flush_async()
            .await
            .map_err(|err| write_error(err.to_string()))?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<(CacheEntry, u64)>, IngestError> {
        Ok(self.read(key)?.map(|current| (current.entry, current.version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::Stats;
    use time::OffsetDateTime;

    fn entry(count: u64) -> CacheEntry {
        CacheEntry {
            city_id: "NYC".to_string(),
            stats: Stats {
                count,
                sum: 100 * count as i64,
                min: 100,
                max: 100,
            },
            uploads: 1,
            partial: false,
            stale: false,
            as_of: OffsetDateTime::UNIX_EPOCH,
        }
    }

    async fn exercise(store: &dyn CacheStore) {
        assert_eq!(None, store.get("city:NYC").await.unwrap());
        assert!(store.set("city:NYC", &entry(1), 5).await.unwrap());
        assert_eq!(Some((entry(1), 5)), store.get("city:NYC").await.unwrap());
        // Equal and older versions are rejected.
        assert!(!store.set("city:NYC", &entry(2), 5).await.unwrap());
        assert!(!store.set("city:NYC", &entry(2), 4).await.unwrap());
        assert_eq!(Some((entry(1), 5)), store.get("city:NYC").await.unwrap());
        assert!(store.set("city:NYC", &entry(3), 9).await.unwrap());
        assert_eq!(Some((entry(3), 9)), store.get("city:NYC").await.unwrap());
        // Keys are independent.
        assert!(store.set("city:LON", &entry(1), 1).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store() {
        exercise(&MemoryCacheStore::new()).await;
    }

    #[tokio::test]
    async fn disk_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&DiskCacheStore::open(dir.path()).unwrap()).await;
    }
}
