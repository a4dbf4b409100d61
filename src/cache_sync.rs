//! Synchronisation of the statistics cache with the durable aggregates.
//!
//! A cache entry holds a city's all-time statistics: the merge of its aggregates across every
//! upload. Entries are always rebuilt from the record store, never patched, and each write
//! carries a version drawn from the record store before the rebuild starts. A rebuild that
//! started later therefore always wins, whatever order the writes reach the cache in.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::cache_store::CacheStore;
use crate::error::IngestError;
use crate::metrics::CACHE_WRITES;
use crate::models::{CacheEntry, CityStatistics, UploadStatus};
use crate::operations::Stats;
use crate::record_store::RecordStore;

/// Delay before the first retry of a failed cache write, doubled on each further retry.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Cache key of a city's statistics.
pub fn cache_key(city_id: &str) -> String {
    format!("city:{city_id}")
}

/// Rebuilds and publishes cache entries
#[derive(Clone)]
pub struct CacheSynchronizer {
    store: RecordStore,
    cache: Arc<dyn CacheStore>,
    write_attempts: u32,
}

impl CacheSynchronizer {
    pub fn new(store: RecordStore, cache: Arc<dyn CacheStore>, write_attempts: u32) -> Self {
        CacheSynchronizer {
            store,
            cache,
            write_attempts: write_attempts.max(1),
        }
    }

    /// Build a city's entry from the durable aggregates, if it has any.
    fn build_entry(&self, city_id: &str) -> Result<Option<CacheEntry>, IngestError> {
        let aggregates = self.store.list_city_aggregates(city_id)?;
        if aggregates.is_empty() {
            return Ok(None);
        }
        let mut stats = Stats::default();
        let mut partial = false;
        for aggregate in &aggregates {
            stats = stats.merge(aggregate.stats);
            let completed = self
                .store
                .get_upload(aggregate.upload_id)?
                .map_or(false, |upload| upload.status == UploadStatus::Completed);
            partial |= !completed;
        }
        Ok(Some(CacheEntry {
            city_id: city_id.to_string(),
            stats,
            uploads: u32::try_from(aggregates.len())?,
            partial,
            stale: false,
            as_of: OffsetDateTime::now_utc(),
        }))
    }

    /// Rebuild a city's entry and write it to the cache.
    ///
    /// Returns the entry visible in the cache afterwards with its version, which is a newer
    /// entry than the one built here if a later rebuild won the race. Returns `None` if the city
    /// has no aggregates.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn publish(&self, city_id: &str) -> Result<Option<(CacheEntry, u64)>, IngestError> {
        let version = self.store.next_version()?;
        let Some(entry) = self.build_entry(city_id)? else {
            return Ok(None);
        };
        self.write(&cache_key(city_id), entry, version).await.map(Some)
    }

    /// Write an entry, retrying failed writes with backoff.
    async fn write(
        &self,
        key: &str,
        entry: CacheEntry,
        version: u64,
    ) -> Result<(CacheEntry, u64), IngestError> {
        let mut delay = WRITE_RETRY_DELAY;
        let mut last_error = None;
        for attempt in 1..=self.write_attempts {
            match self.cache.set(key, &entry, version).await {
                Ok(true) => {
                    CACHE_WRITES.with_label_values(&["written"]).inc();
                    return Ok((entry, version));
                }
                Ok(false) => {
                    CACHE_WRITES.with_label_values(&["rejected"]).inc();
                    tracing::debug!("Cache entry {} already newer than version {}", key, version);
                    if let Ok(Some(current)) = self.cache.get(key).await {
                        if current.1 > version {
                            return Ok(current);
                        }
                    }
                    return Ok((entry, version));
                }
                Err(err) => {
                    tracing::warn!("Cache write {} attempt {} failed: {}", key, attempt, err);
                    last_error = Some(err);
                    if attempt < self.write_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        CACHE_WRITES.with_label_values(&["failed"]).inc();
        Err(IngestError::CacheWrite {
            key: key.to_string(),
            reason: last_error.map_or_else(String::new, |err| err.to_string()),
        })
    }

    /// Publish the entries of several cities.
    ///
    /// Cache write failures are logged and skipped; record store failures are returned.
    pub async fn publish_many(&self, cities: &BTreeSet<String>) -> Result<usize, IngestError> {
        let mut published = 0;
        for city_id in cities {
            match self.publish(city_id).await {
                Ok(Some(_)) => published += 1,
                Ok(None) => {}
                Err(IngestError::CacheWrite { key, reason }) => {
                    tracing::error!("Failed to publish {}: {}", key, reason);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(published)
    }

    /// Return a city's statistics.
    ///
    /// Served from the cache unless the entry is missing or stale, in which case it is rebuilt
    /// from the record store and written through. If the write fails the rebuilt statistics are
    /// served under the last version the cache holds, 0 if it holds none, so a reported version
    /// is always one that was stored.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn statistics(&self, city_id: &str) -> Result<CityStatistics, IngestError> {
        let key = cache_key(city_id);
        let mut stored_version = 0;
        match self.cache.get(&key).await {
            Ok(Some((entry, version))) if !entry.stale => {
                return Ok(CityStatistics::from_entry(&entry, version))
            }
            Ok(Some((_, version))) => stored_version = version,
            Ok(None) => {}
            Err(err) => tracing::warn!("Cache read {} failed: {}", key, err),
        }
        let version = self.store.next_version()?;
        let entry = self
            .build_entry(city_id)?
            .ok_or_else(|| IngestError::CityNotFound(city_id.to_string()))?;
        match self.write(&key, entry.clone(), version).await {
            Ok((entry, version)) => Ok(CityStatistics::from_entry(&entry, version)),
            Err(IngestError::CacheWrite { .. }) => {
                if let Ok(Some((_, version))) = self.cache.get(&key).await {
                    stored_version = stored_version.max(version);
                }
                Ok(CityStatistics::from_entry(&entry, stored_version))
            }
            Err(err) => Err(err),
        }
    }

    /// Flag cities' entries as stale so the next read rebuilds them.
    pub async fn mark_stale(&self, cities: &BTreeSet<String>) -> Result<(), IngestError> {
        for city_id in cities {
            let key = cache_key(city_id);
            let Some((mut entry, _)) = self.cache.get(&key).await? else {
                continue;
            };
            if entry.stale {
                continue;
            }
            entry.stale = true;
            let version = self.store.next_version()?;
            if let Err(err) = self.write(&key, entry, version).await {
                tracing::error!("Failed to mark {} stale: {}", key, err);
            }
        }
        Ok(())
    }

    /// Rebuild one city's entry on demand.
    pub async fn refresh_city(&self, city_id: &str) -> Result<CityStatistics, IngestError> {
        let (entry, version) = self
            .publish(city_id)
            .await?
            .ok_or_else(|| IngestError::CityNotFound(city_id.to_string()))?;
        Ok(CityStatistics::from_entry(&entry, version))
    }

    /// Rebuild the entry of every city with aggregates.
    pub async fn refresh_all(&self) -> Result<usize, IngestError> {
        let cities = self.store.list_cities()?;
        let published = self.publish_many(&cities).await?;
        tracing::info!("Refreshed {} of {} cached cities", published, cities.len());
        Ok(published)
    }
}
