///! Conversion pipeline: cache -> propagator -> geodetic converter -> batch
///!
///! Each run is a producer task and a consumer joined by a capacity-1
///! channel. Starting a run cancels the previous one; only the most
///! recently started run may publish, and publishing happens under the same
///! lock that registers new runs, so a batch is either fully visible or not
///! at all.
use chrono::{DateTime, Utc};
use skywatch_common::{DisplayPosition, OrbitalElementRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::RecordPredicate;
use super::geodetic;
use super::propagator::Propagator;
use crate::error::PipelineError;
use crate::model::sat::{OrbitalElementCache, PipelineEvent, PositionBatch};

struct ActiveRun {
    run: u64,
    token: CancellationToken,
}

pub struct ConversionPipeline {
    cache: Arc<OrbitalElementCache>,
    propagator: Arc<dyn Propagator>,
    events: broadcast::Sender<PipelineEvent>,

    generation: AtomicU64,
    active: Mutex<Option<ActiveRun>>,

    /// Last published batch
    published: watch::Sender<Arc<PositionBatch>>,
}

impl ConversionPipeline {
    pub fn new(
        cache: Arc<OrbitalElementCache>,
        propagator: Arc<dyn Propagator>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let (published, _) = watch::channel(Arc::new(PositionBatch::empty(0, Utc::now())));
        Self {
            cache,
            propagator,
            events,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            published,
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver that always holds the most recently published batch
    pub fn positions(&self) -> watch::Receiver<Arc<PositionBatch>> {
        self.published.subscribe()
    }

    pub fn latest(&self) -> Arc<PositionBatch> {
        self.published.borrow().clone()
    }

    /// Whether a run is currently converting
    pub fn is_running(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Cancel the active run, if any, without starting a new one
    pub fn cancel_active(&self) {
        if let Some(active) = self.lock_active().take() {
            debug!("Cancelling conversion run #{}", active.run);
            active.token.cancel();
        }
    }

    /// Convert the records matching `predicate` at the current instant
    pub async fn request_update(
        self: &Arc<Self>,
        predicate: RecordPredicate,
    ) -> Result<Arc<PositionBatch>, PipelineError> {
        self.request_update_at(predicate, Utc::now()).await
    }

    /// Start a run at `epoch`, superseding whatever run is active
    ///
    /// The run is a task of its own, so dropping the returned future does
    /// not interrupt it. A run that is superseded before it publishes
    /// resolves to [`PipelineError::Superseded`].
    pub async fn request_update_at(
        self: &Arc<Self>,
        predicate: RecordPredicate,
        epoch: DateTime<Utc>,
    ) -> Result<Arc<PositionBatch>, PipelineError> {
        let token = CancellationToken::new();
        let run = {
            let mut active = self.lock_active();
            let run = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(previous) = active.replace(ActiveRun {
                run,
                token: token.clone(),
            }) {
                debug!("Conversion run #{} supersedes run #{}", run, previous.run);
                previous.token.cancel();
            }
            run
        };

        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeline.execute(run, predicate, epoch, token).await });
        handle.await?
    }

    async fn execute(
        &self,
        run: u64,
        predicate: RecordPredicate,
        epoch: DateTime<Utc>,
        token: CancellationToken,
    ) -> Result<Arc<PositionBatch>, PipelineError> {
        let records = self.cache.all().await;
        if records.is_empty() {
            debug!("Conversion run #{}: cache is empty", run);
            return self.publish(run, &token, PositionBatch::empty(run, epoch), 0);
        }

        let (tx, mut rx) = mpsc::channel::<OrbitalElementRecord>(1);

        let producer = {
            let token = token.clone();
            tokio::spawn(async move {
                let mut sent = 0usize;
                for record in records {
                    if token.is_cancelled() {
                        break;
                    }
                    if !predicate(&record) {
                        continue;
                    }
                    if tx.send(record).await.is_err() {
                        // Consumer stopped
                        break;
                    }
                    sent += 1;
                }
                sent
            })
        };

        let mut positions: Vec<DisplayPosition> = Vec::new();
        let mut skipped = 0usize;
        while let Some(record) = rx.recv().await {
            if token.is_cancelled() {
                break;
            }
            match self.propagator.propagate(&record, epoch).await {
                Ok(position) => {
                    let point = geodetic::to_geodetic(position);
                    positions.push(DisplayPosition::from_record(&record, point));
                }
                Err(e) => {
                    debug!("Conversion run #{}: skipping {}: {}", run, record.name, e);
                    skipped += 1;
                }
            }
        }
        drop(rx);

        let sent = match producer.await {
            Ok(sent) => sent,
            Err(e) => {
                self.release(run);
                return Err(e.into());
            }
        };
        debug!(
            "Conversion run #{}: {} sent, {} converted, {} skipped",
            run,
            sent,
            positions.len(),
            skipped
        );
        if skipped > 0 {
            warn!(
                "Conversion run #{}: {} objects failed to propagate",
                run, skipped
            );
        }

        self.publish(
            run,
            &token,
            PositionBatch {
                run,
                epoch,
                positions,
            },
            skipped,
        )
    }

    /// Drop the registration of `run` if it still holds it
    fn release(&self, run: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.run == run) {
            *active = None;
        }
    }

    /// Swap `batch` into the visible slot if `run` is still the newest run.
    /// Runs entirely under the registration lock.
    fn publish(
        &self,
        run: u64,
        token: &CancellationToken,
        batch: PositionBatch,
        skipped: usize,
    ) -> Result<Arc<PositionBatch>, PipelineError> {
        let mut active = self.lock_active();
        let is_current = active.as_ref().is_some_and(|a| a.run == run);
        if !is_current || token.is_cancelled() {
            debug!(
                "Conversion run #{} discarded {} positions",
                run,
                batch.len()
            );
            return Err(PipelineError::Superseded(run));
        }
        *active = None;

        let batch = Arc::new(batch);
        self.published.send_replace(batch.clone());
        drop(active);

        info!(
            "Published run #{} with {} positions ({} skipped)",
            run,
            batch.len(),
            skipped
        );
        let _ = self.events.send(PipelineEvent::PositionsPublished {
            run,
            count: batch.len(),
        });
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PropagationError;
    use crate::model::sat::testing::{CALSPHERE_1, CALSPHERE_2, NAVSTAR_56};
    use crate::model::sat::MemoryStore;
    use crate::module::conversion::filter::{match_all, SatelliteFilter};
    use crate::module::conversion::propagator::Sgp4Propagator;
    use approx::assert_abs_diff_eq;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use skywatch_common::CartesianPosition;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Reference vector with a precomputed geodetic fix
    const REFERENCE: CartesianPosition = CartesianPosition::new(-4400.594, 1932.870, 4760.712);
    const REFERENCE_LAT: f64 = 44.9044057307814;
    const REFERENCE_LON: f64 = 156.28750959891778;

    /// Returns the reference vector, optionally failing or sleeping
    #[derive(Default)]
    struct StubPropagator {
        fail_for: Option<&'static str>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Propagator for StubPropagator {
        async fn propagate(
            &self,
            record: &OrbitalElementRecord,
            _epoch: DateTime<Utc>,
        ) -> Result<CartesianPosition, PropagationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_for == Some(record.catalog_id.as_str()) {
                return Err(PropagationError::StaleElements {
                    catalog_id: record.catalog_id.clone(),
                    reason: "decayed".to_string(),
                });
            }
            Ok(REFERENCE)
        }
    }

    async fn seeded_cache(sets: &[(&str, &str, &str)]) -> Arc<OrbitalElementCache> {
        let cache = Arc::new(OrbitalElementCache::new(
            Arc::new(MemoryStore::new()),
            chrono::Duration::hours(24),
        ));
        for (id, name, elements) in sets {
            cache
                .upsert(OrbitalElementRecord::new(*id, *name, *elements))
                .await
                .unwrap();
        }
        cache
    }

    fn pipeline(
        cache: Arc<OrbitalElementCache>,
        propagator: Arc<StubPropagator>,
    ) -> (Arc<ConversionPipeline>, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (Arc::new(ConversionPipeline::new(cache, propagator, tx)), rx)
    }

    #[tokio::test]
    async fn test_single_record_matches_reference() {
        let cache = seeded_cache(&[("00900", "CALSPHERE 1", CALSPHERE_1)]).await;
        let (pipeline, _) = pipeline(cache, Arc::new(StubPropagator::default()));

        let batch = pipeline.request_update(match_all()).await.unwrap();
        assert_eq!(batch.len(), 1);
        let position = &batch.positions[0];
        assert_eq!(position.catalog_id, "00900");
        assert_eq!(position.name, "CALSPHERE 1");
        assert_abs_diff_eq!(position.latitude_deg, REFERENCE_LAT, epsilon = 1e-9);
        assert_abs_diff_eq!(position.longitude_deg, REFERENCE_LON, epsilon = 1e-9);
        assert_eq!(pipeline.latest(), batch);
    }

    #[tokio::test]
    async fn test_sgp4_position_matches_two_body_reference() {
        let cache = seeded_cache(&[("00900", "CALSPHERE 1", CALSPHERE_1)]).await;
        let (tx, _) = broadcast::channel(8);
        let pipeline = Arc::new(ConversionPipeline::new(
            cache,
            Arc::new(Sgp4Propagator::default()),
            tx,
        ));

        // 25 minutes after the element epoch (2020 day 178.87487168)
        let epoch = Utc.with_ymd_and_hms(2020, 6, 26, 21, 24, 48).unwrap()
            + chrono::Duration::milliseconds(913);
        let batch = pipeline.request_update_at(match_all(), epoch).await.unwrap();
        assert_eq!(batch.len(), 1);

        // Kepler propagation of the mean elements, rotated by IAU-82 GMST
        // (236.66 deg). A reversed rotation would put the object near 81.3 E.
        let position = &batch.positions[0];
        assert_abs_diff_eq!(position.latitude_deg, -3.233, epsilon = 0.5);
        assert_abs_diff_eq!(position.longitude_deg, -31.988, epsilon = 0.5);
    }

    #[tokio::test]
    async fn test_failed_producer_releases_run() {
        let cache = seeded_cache(&[("00900", "CALSPHERE 1", CALSPHERE_1)]).await;
        let (pipeline, _) = pipeline(cache, Arc::new(StubPropagator::default()));

        let exploding: RecordPredicate = Arc::new(|_| panic!("predicate failed"));
        let err = pipeline.request_update(exploding).await.unwrap_err();
        assert!(matches!(err, PipelineError::TaskFailed(_)));
        assert!(!pipeline.is_running());

        // The next run is unaffected
        assert_eq!(pipeline.request_update(match_all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prefix_filter_selects_navstar() {
        let cache = seeded_cache(&[
            ("28874", "NAVSTAR 56", NAVSTAR_56),
            ("00900", "CALSPHERE 1", CALSPHERE_1),
        ])
        .await;
        let (pipeline, _) = pipeline(cache, Arc::new(StubPropagator::default()));

        let batch = pipeline
            .request_update(SatelliteFilter::name_prefix("NAVSTAR").into_predicate())
            .await
            .unwrap();
        let names: Vec<&str> = batch.positions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["NAVSTAR 56"]);
    }

    #[tokio::test]
    async fn test_propagation_failure_skips_one_object() {
        let cache = seeded_cache(&[
            ("00900", "CALSPHERE 1", CALSPHERE_1),
            ("28874", "NAVSTAR 56", NAVSTAR_56),
            ("00902", "CALSPHERE 2", CALSPHERE_2),
        ])
        .await;
        let propagator = Arc::new(StubPropagator {
            fail_for: Some("28874"),
            ..Default::default()
        });
        let (pipeline, _) = pipeline(cache, propagator.clone());

        let batch = pipeline.request_update(match_all()).await.unwrap();
        let ids: Vec<&str> = batch.positions.iter().map(|p| p.catalog_id.as_str()).collect();
        assert_eq!(ids, vec!["00900", "00902"]);
        assert_eq!(propagator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_cache_publishes_empty_batch() {
        let cache = seeded_cache(&[]).await;
        let propagator = Arc::new(StubPropagator::default());
        let (pipeline, mut events) = pipeline(cache, propagator.clone());

        let batch = pipeline.request_update(match_all()).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.run, 1);
        assert_eq!(propagator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            PipelineEvent::PositionsPublished { run: 1, count: 0 }
        );
    }

    #[tokio::test]
    async fn test_empty_filter_result_is_not_an_error() {
        let cache = seeded_cache(&[("00900", "CALSPHERE 1", CALSPHERE_1)]).await;
        let (pipeline, _) = pipeline(cache, Arc::new(StubPropagator::default()));

        let batch = pipeline
            .request_update(SatelliteFilter::favorites().into_predicate())
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_newer_run_supersedes_older() {
        let cache = seeded_cache(&[
            ("00900", "CALSPHERE 1", CALSPHERE_1),
            ("00902", "CALSPHERE 2", CALSPHERE_2),
            ("28874", "NAVSTAR 56", NAVSTAR_56),
        ])
        .await;
        let propagator = Arc::new(StubPropagator {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let (pipeline, mut events) = pipeline(cache, propagator);

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.request_update(match_all()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = pipeline
            .request_update(SatelliteFilter::name_prefix("NAVSTAR").into_predicate())
            .await
            .unwrap();

        let first = first.await.unwrap();
        assert!(matches!(first, Err(PipelineError::Superseded(1))));
        assert_eq!(second.run, 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second.positions[0].name, "NAVSTAR 56");

        // Let the superseded run wind down, then check what is visible
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pipeline.latest(), second);

        let mut published = Vec::new();
        while let Ok(event) = events.try_recv() {
            published.push(event);
        }
        assert_eq!(
            published,
            vec![PipelineEvent::PositionsPublished { run: 2, count: 1 }]
        );
    }

    #[tokio::test]
    async fn test_dropped_caller_still_publishes() {
        let cache = seeded_cache(&[("00900", "CALSPHERE 1", CALSPHERE_1)]).await;
        let propagator = Arc::new(StubPropagator {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let (pipeline, _) = pipeline(cache, propagator);
        let mut positions = pipeline.positions();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(5), pipeline.request_update(match_all())).await;
        assert!(timed_out.is_err());

        positions.changed().await.unwrap();
        let batch = positions.borrow().clone();
        assert_eq!(batch.run, 1);
        assert_eq!(batch.len(), 1);
    }
}
