use serde::Serialize;
use skywatch_common::OrbitalElementRecord;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CacheError, PipelineError, RefreshError, StoreError};
use crate::model::sat::{
    CacheStats, CatalogFetcher, ElementStore, OrbitalElementCache, PipelineEvent, PositionBatch,
    RefreshReport, RefreshScheduler, RefreshSettings, RefreshStatus,
};
use crate::module::conversion::{ConversionPipeline, Propagator, RecordPredicate, SatelliteFilter};

/// Slots in the event channel; slow subscribers lag rather than block
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub refresh: RefreshSettings,
    /// Cache time-to-live
    pub ttl: chrono::Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub refresh: RefreshStatus,
    pub converting: bool,
    /// Run number of the visible batch, 0 before the first publish
    pub published_run: u64,
    pub published_positions: usize,
}

/// What the UI talks to: element cache, refresh scheduler and conversion
/// pipeline behind one object, with notifications on a single broadcast
/// channel.
pub struct SatelliteService {
    cache: Arc<OrbitalElementCache>,
    scheduler: RefreshScheduler,
    pipeline: Arc<ConversionPipeline>,
    events: broadcast::Sender<PipelineEvent>,
    filter: RwLock<SatelliteFilter>,
}

impl SatelliteService {
    pub fn new(
        store: Arc<dyn ElementStore>,
        fetcher: Arc<dyn CatalogFetcher>,
        propagator: Arc<dyn Propagator>,
        settings: ServiceSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cache = Arc::new(OrbitalElementCache::new(store, settings.ttl));
        let scheduler = RefreshScheduler::new(
            cache.clone(),
            fetcher,
            settings.refresh,
            events.clone(),
        );
        let pipeline = Arc::new(ConversionPipeline::new(
            cache.clone(),
            propagator,
            events.clone(),
        ));

        Self {
            cache,
            scheduler,
            pipeline,
            events,
            filter: RwLock::new(SatelliteFilter::default()),
        }
    }

    /// Load persisted records, rebuilding from the remote catalog when the
    /// cache is empty or stale
    pub async fn initialize(&self) -> Result<CacheStats, CacheError> {
        let stats = self.scheduler.initialize().await?;
        info!(
            "Satellite service ready: {} records, {} favourites",
            stats.records, stats.favorites
        );
        Ok(stats)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Force a refresh, superseding any refresh in flight
    pub async fn request_refresh(&self) -> Result<RefreshReport, RefreshError> {
        self.scheduler.refresh().await
    }

    pub async fn refresh_if_stale(&self) -> Result<Option<RefreshReport>, RefreshError> {
        self.scheduler.refresh_if_stale().await
    }

    /// Convert the records matching `predicate`, superseding any run in
    /// progress
    pub async fn request_update(
        &self,
        predicate: RecordPredicate,
    ) -> Result<Arc<PositionBatch>, PipelineError> {
        let result = self.pipeline.request_update(predicate).await;
        match &result {
            Err(e) if e.is_superseded() => debug!("Position update dropped: {}", e),
            Err(e) => warn!("Position update failed: {}", e),
            Ok(_) => {}
        }
        result
    }

    pub async fn set_filter(&self, filter: SatelliteFilter) {
        debug!("Filter set to {}", filter);
        *self.filter.write().await = filter;
    }

    pub async fn filter(&self) -> SatelliteFilter {
        self.filter.read().await.clone()
    }

    /// [`Self::request_update`] with the stored filter
    pub async fn request_filtered_update(&self) -> Result<Arc<PositionBatch>, PipelineError> {
        let filter = self.filter().await;
        self.request_update(filter.into_predicate()).await
    }

    pub fn positions(&self) -> watch::Receiver<Arc<PositionBatch>> {
        self.pipeline.positions()
    }

    pub fn latest_positions(&self) -> Arc<PositionBatch> {
        self.pipeline.latest()
    }

    pub fn status(&self) -> ServiceStatus {
        let latest = self.pipeline.latest();
        ServiceStatus {
            refresh: self.scheduler.status(),
            converting: self.pipeline.is_running(),
            published_run: latest.run,
            published_positions: latest.len(),
        }
    }

    /// Flip and persist the favourite flag; returns the new value
    pub async fn toggle_favorite(&self, catalog_id: &str) -> Result<bool, CacheError> {
        let is_favorite = self.cache.toggle_favorite(catalog_id).await?;
        info!("Favourite {} set to {}", catalog_id, is_favorite);
        Ok(is_favorite)
    }

    pub async fn all_records(&self) -> Vec<OrbitalElementRecord> {
        self.cache.all().await
    }

    pub async fn by_name_prefix(&self, prefix: &str) -> Vec<OrbitalElementRecord> {
        self.cache.by_name_prefix(prefix).await
    }

    pub async fn favorites_only(&self) -> Vec<OrbitalElementRecord> {
        self.cache.favorites_only().await
    }

    /// Cancel in-flight work and compact the journal
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        info!("Shutting down satellite service...");
        self.scheduler.cancel();
        self.pipeline.cancel_active();
        self.cache.compact().await
    }
}
