use chrono::{DateTime, Utc};
use skywatch_common::OrbitalElementRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::store::{ElementStore, StoreSnapshot};
use super::types::{CacheMetadata, CacheStats};
use crate::error::{CacheError, StoreError};

/// Result of merging one refreshed record into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Keyed cache of orbital elements, write-through to an [`ElementStore`]
///
/// Every mutating call persists before the in-memory state changes, so a
/// failed write leaves the cache exactly as it was.
pub struct OrbitalElementCache {
    store: Arc<dyn ElementStore>,

    /// Records keyed by catalog id
    records: RwLock<HashMap<String, OrbitalElementRecord>>,

    metadata: RwLock<CacheMetadata>,

    /// Mirror of `records.len()`, readable without the lock
    count: AtomicUsize,

    loaded: AtomicBool,

    ttl: chrono::Duration,
}

impl OrbitalElementCache {
    /// Create an empty cache over `store`. Call [`Self::load`] before use.
    pub fn new(store: Arc<dyn ElementStore>, ttl: chrono::Duration) -> Self {
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            metadata: RwLock::new(CacheMetadata::default()),
            count: AtomicUsize::new(0),
            loaded: AtomicBool::new(false),
            ttl,
        }
    }

    /// Load persisted records. Only the first call reads the store; later
    /// calls just report the current stats.
    pub async fn load(&self) -> Result<CacheStats, CacheError> {
        if !self.loaded.load(Ordering::SeqCst) {
            let mut records = self.records.write().await;
            // Re-check under the lock in case two loads raced
            if !self.loaded.load(Ordering::SeqCst) {
                let StoreSnapshot {
                    records: stored,
                    metadata,
                } = self.store.load().await?;

                *records = stored;
                *self.metadata.write().await = metadata;
                self.count.store(records.len(), Ordering::SeqCst);
                self.loaded.store(true, Ordering::SeqCst);
                info!("Orbital element cache loaded with {} records", records.len());
            }
        }
        Ok(self.stats().await)
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Whether the last successful sync is older than `ttl`
    pub async fn is_stale(&self, ttl: chrono::Duration) -> bool {
        self.metadata.read().await.is_stale(ttl, Utc::now())
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.metadata.read().await.last_sync
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let favorites = {
            let records = self.records.read().await;
            records.values().filter(|r| r.is_favorite).count()
        };
        let metadata = self.metadata.read().await;
        CacheStats {
            records: self.len(),
            favorites,
            last_sync: metadata.last_sync,
            stale: metadata.is_stale(self.ttl, Utc::now()),
        }
    }

    /// Insert or replace a record as given, favourite flag included
    pub async fn upsert(&self, record: OrbitalElementRecord) -> Result<(), CacheError> {
        let mut records = self.records.write().await;
        self.store.put_record(&record).await?;
        records.insert(record.catalog_id.clone(), record);
        self.count.store(records.len(), Ordering::SeqCst);
        Ok(())
    }

    /// Refresh-time upsert: takes name, element set and catalog metadata
    /// from `record` but keeps the stored favourite flag. Unknown ids are
    /// inserted as non-favourites.
    pub async fn merge_refreshed(
        &self,
        mut record: OrbitalElementRecord,
    ) -> Result<MergeOutcome, StoreError> {
        let mut records = self.records.write().await;

        let outcome = match records.get(&record.catalog_id) {
            Some(existing) => {
                record.is_favorite = existing.is_favorite;
                if *existing == record {
                    return Ok(MergeOutcome::Unchanged);
                }
                MergeOutcome::Updated
            }
            None => {
                record.is_favorite = false;
                MergeOutcome::Inserted
            }
        };

        self.store.put_record(&record).await?;
        records.insert(record.catalog_id.clone(), record);
        self.count.store(records.len(), Ordering::SeqCst);
        Ok(outcome)
    }

    pub async fn get(&self, catalog_id: &str) -> Option<OrbitalElementRecord> {
        self.records.read().await.get(catalog_id).cloned()
    }

    /// Snapshot of every record, ordered by catalog id
    pub async fn all(&self) -> Vec<OrbitalElementRecord> {
        self.collect(|_| true).await
    }

    /// Records whose name starts with `prefix`, ignoring case
    pub async fn by_name_prefix(&self, prefix: &str) -> Vec<OrbitalElementRecord> {
        self.collect(|r| r.name_starts_with(prefix)).await
    }

    pub async fn favorites_only(&self) -> Vec<OrbitalElementRecord> {
        self.collect(|r| r.is_favorite).await
    }

    /// Snapshot of the records matching `predicate`, ordered by catalog id
    pub async fn collect<F>(&self, predicate: F) -> Vec<OrbitalElementRecord>
    where
        F: Fn(&OrbitalElementRecord) -> bool,
    {
        let records = self.records.read().await;
        let mut matched: Vec<OrbitalElementRecord> =
            records.values().filter(|r| predicate(r)).cloned().collect();
        matched.sort_by(|a, b| a.catalog_id.cmp(&b.catalog_id));
        matched
    }

    /// Flip the favourite flag and persist it. Returns the new value.
    pub async fn toggle_favorite(&self, catalog_id: &str) -> Result<bool, CacheError> {
        let mut records = self.records.write().await;

        let mut updated = records
            .get(catalog_id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(catalog_id.to_string()))?;
        updated.is_favorite = !updated.is_favorite;

        self.store.put_record(&updated).await?;
        let is_favorite = updated.is_favorite;
        records.insert(catalog_id.to_string(), updated);

        debug!("Toggled favourite for {}: {}", catalog_id, is_favorite);
        Ok(is_favorite)
    }

    /// Advance the last-sync instant. An instant that is not newer than the
    /// current one is ignored and `false` is returned.
    pub async fn mark_synced(&self, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut metadata = self.metadata.write().await;
        if matches!(metadata.last_sync, Some(current) if current >= at) {
            debug!("Ignoring sync timestamp {} older than current", at);
            return Ok(false);
        }

        let next = CacheMetadata { last_sync: Some(at) };
        self.store.put_metadata(&next).await?;
        *metadata = next;
        Ok(true)
    }

    /// Rewrite the durable store as a single snapshot
    pub async fn compact(&self) -> Result<(), StoreError> {
        // Readers keep going; writers wait until the snapshot has landed
        let records = self.records.read().await;
        let metadata = self.metadata.read().await;
        let snapshot = StoreSnapshot {
            records: records.clone(),
            metadata: metadata.clone(),
        };
        self.store.compact(&snapshot).await
    }
}
