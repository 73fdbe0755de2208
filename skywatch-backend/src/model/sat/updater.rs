use chrono::Utc;
use skywatch_common::OrbitalElementRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api_client::CatalogFetcher;
use super::cache::{MergeOutcome, OrbitalElementCache};
use super::parser::{self, CatalogMetadata, ParsedElementSet};
use super::types::{CacheStats, PipelineEvent, RefreshReport, RefreshStatus};
use crate::error::{CacheError, RefreshError};

/// Where the catalog lives
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// 3-line element-set text
    pub elements_url: String,
    /// Optional OMM XML with names, designators and epochs
    pub metadata_url: Option<String>,
}

struct ActiveRefresh {
    generation: u64,
    token: CancellationToken,
}

/// Single-flight refresh of the orbital element cache
///
/// Starting a refresh while another is fetching cancels the older one; only
/// the newest generation ever reports completion or failure.
pub struct RefreshScheduler {
    cache: Arc<OrbitalElementCache>,
    fetcher: Arc<dyn CatalogFetcher>,
    settings: RefreshSettings,
    events: broadcast::Sender<PipelineEvent>,

    generation: AtomicU64,
    active: Mutex<Option<ActiveRefresh>>,

    in_flight: AtomicBool,
    percent: AtomicUsize,
}

/// Clears the in-flight state when the owning refresh ends, including when
/// its future is dropped before completion
struct FlightGuard<'a> {
    scheduler: &'a RefreshScheduler,
    generation: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.scheduler.lock_active();
        if active
            .as_ref()
            .is_some_and(|a| a.generation == self.generation)
        {
            *active = None;
            self.scheduler.in_flight.store(false, Ordering::SeqCst);
        }
    }
}

impl RefreshScheduler {
    pub fn new(
        cache: Arc<OrbitalElementCache>,
        fetcher: Arc<dyn CatalogFetcher>,
        settings: RefreshSettings,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            settings,
            events,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            percent: AtomicUsize::new(0),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRefresh>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the persisted cache and rebuild it if it is empty or stale
    ///
    /// A failed rebuild is returned only when there is nothing cached to
    /// fall back on.
    pub async fn initialize(&self) -> Result<CacheStats, CacheError> {
        let loaded = self.cache.load().await?;
        info!(
            "Cache holds {} records ({} favourites, stale: {})",
            loaded.records, loaded.favorites, loaded.stale
        );

        match self.refresh_if_stale().await {
            Ok(_) | Err(RefreshError::Superseded(_)) => {}
            Err(e) if !self.cache.is_empty() => {
                warn!(
                    "Initial refresh failed, serving {} cached records: {}",
                    self.cache.len(),
                    e
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.cache.stats().await)
    }

    /// Refresh when the cache is empty or older than its TTL. Returns
    /// `Ok(None)` without touching the network otherwise, and also while
    /// another refresh is already in flight.
    pub async fn refresh_if_stale(&self) -> Result<Option<RefreshReport>, RefreshError> {
        if self.in_flight.load(Ordering::SeqCst) {
            debug!("Refresh already in flight, skipping staleness check");
            return Ok(None);
        }
        if !self.cache.is_empty() && !self.cache.is_stale(self.cache.ttl()).await {
            return Ok(None);
        }
        self.refresh().await.map(Some)
    }

    /// Fetch the catalog and merge it into the cache, superseding any
    /// refresh that is still running
    pub async fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        let token = CancellationToken::new();
        let generation = {
            let mut active = self.lock_active();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(previous) = active.replace(ActiveRefresh {
                generation,
                token: token.clone(),
            }) {
                info!(
                    "Refresh #{} supersedes in-flight refresh #{}",
                    generation, previous.generation
                );
                previous.token.cancel();
            }
            self.in_flight.store(true, Ordering::SeqCst);
            self.percent.store(0, Ordering::SeqCst);
            generation
        };
        let _guard = FlightGuard {
            scheduler: self,
            generation,
        };

        info!("Refresh #{} started", generation);
        let _ = self.events.send(PipelineEvent::RefreshStarted { generation });

        let result = self.run(generation, &token).await;

        match &result {
            Ok(report) => {
                info!(
                    "Refresh #{} completed: {} fetched, {} inserted, {} updated, {} malformed skipped ({:.2}s)",
                    generation,
                    report.fetched,
                    report.inserted,
                    report.updated,
                    report.skipped_malformed,
                    report.duration_seconds
                );
                let _ = self.events.send(PipelineEvent::RefreshCompleted {
                    report: report.clone(),
                });
            }
            Err(RefreshError::Superseded(_)) => {
                debug!("Refresh #{} was superseded", generation);
            }
            Err(e) => {
                error!("Refresh #{} failed: {}", generation, e);
                let _ = self.events.send(PipelineEvent::RefreshFailed {
                    generation,
                    reason: e.to_string(),
                });
            }
        }

        result
    }

    /// Cancel the in-flight refresh, if any. Its caller sees `Superseded`.
    pub fn cancel(&self) {
        if let Some(active) = self.lock_active().as_ref() {
            debug!("Cancelling refresh #{}", active.generation);
            active.token.cancel();
        }
    }

    pub fn status(&self) -> RefreshStatus {
        RefreshStatus {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            percent: self.percent.load(Ordering::SeqCst),
            records: self.cache.len(),
        }
    }

    async fn run(
        &self,
        generation: u64,
        token: &CancellationToken,
    ) -> Result<RefreshReport, RefreshError> {
        let started = Instant::now();

        let text = self
            .fetch(&self.settings.elements_url, generation, token)
            .await?;
        let metadata = self.fetch_metadata(generation, token).await?;

        let parsed = parser::parse_element_sets(&text);
        if !parsed.errors.is_empty() {
            warn!(
                "Refresh #{}: skipped {} malformed element sets",
                generation,
                parsed.errors.len()
            );
        }

        // Nothing usable means the sync did not happen; leave the timestamp
        // alone so the next trigger retries
        let total = parsed.entries.len();
        if total == 0 {
            return Err(RefreshError::EmptyCatalog {
                skipped_malformed: parsed.errors.len(),
            });
        }

        let full_rebuild = self.cache.is_empty();
        if full_rebuild {
            info!(
                "Refresh #{}: populating empty cache with {} records",
                generation, total
            );
        }

        let mut report = RefreshReport {
            generation,
            fetched: total,
            skipped_malformed: parsed.errors.len(),
            full_rebuild,
            ..Default::default()
        };

        for (processed, entry) in parsed.entries.into_iter().enumerate() {
            if token.is_cancelled() {
                return Err(RefreshError::Superseded(generation));
            }

            let meta = metadata.get(&entry.catalog_id);
            match self.cache.merge_refreshed(build_record(entry, meta)).await? {
                MergeOutcome::Inserted => report.inserted += 1,
                MergeOutcome::Updated => report.updated += 1,
                MergeOutcome::Unchanged => {}
            }

            self.report_progress(generation, (processed + 1) * 100 / total);
        }

        if token.is_cancelled() {
            return Err(RefreshError::Superseded(generation));
        }

        self.cache.mark_synced(Utc::now()).await?;
        self.cache.compact().await?;

        report.duration_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }

    async fn fetch(
        &self,
        url: &str,
        generation: u64,
        token: &CancellationToken,
    ) -> Result<String, RefreshError> {
        tokio::select! {
            _ = token.cancelled() => Err(RefreshError::Superseded(generation)),
            body = self.fetcher.fetch_text(url) => Ok(body?),
        }
    }

    /// Metadata is best effort: a failed fetch or parse leaves names from
    /// the element-set title lines
    async fn fetch_metadata(
        &self,
        generation: u64,
        token: &CancellationToken,
    ) -> Result<HashMap<String, CatalogMetadata>, RefreshError> {
        let Some(url) = self.settings.metadata_url.as_deref() else {
            return Ok(HashMap::new());
        };

        let xml = match self.fetch(url, generation, token).await {
            Ok(xml) => xml,
            Err(RefreshError::Superseded(g)) => return Err(RefreshError::Superseded(g)),
            Err(e) => {
                warn!("Refresh #{}: metadata unavailable: {}", generation, e);
                return Ok(HashMap::new());
            }
        };

        match parser::parse_catalog_xml(&xml) {
            Ok(parsed) => {
                if !parsed.errors.is_empty() {
                    warn!(
                        "Refresh #{}: skipped {} malformed metadata entries",
                        generation,
                        parsed.errors.len()
                    );
                }
                Ok(parsed.into_map())
            }
            Err(e) => {
                warn!("Refresh #{}: failed to parse metadata: {}", generation, e);
                Ok(HashMap::new())
            }
        }
    }

    fn report_progress(&self, generation: u64, percent: usize) {
        let previous = self.percent.swap(percent, Ordering::SeqCst);
        if previous != percent {
            let _ = self
                .events
                .send(PipelineEvent::RefreshProgress { generation, percent });
        }
    }
}

fn build_record(entry: ParsedElementSet, metadata: Option<&CatalogMetadata>) -> OrbitalElementRecord {
    let mut record = OrbitalElementRecord::new(entry.catalog_id, entry.name, entry.element_set);
    if let Some(meta) = metadata {
        record.name = meta.name.clone();
        record.international_designator = meta.international_designator.clone();
        record.epoch = meta.epoch;
    }
    record
}
