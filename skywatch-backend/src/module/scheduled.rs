///! Scheduled task manager - periodic background work for the satellite service
///!
///! - Refresh recheck: refreshes the element cache once its TTL has expired
///! - Position update: reconverts the current filter so the map stays live

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ScheduleConfig;
use crate::error::RefreshError;
use crate::service::SatelliteService;

/// Upper bound on one refresh before the scheduler gives up on it
const REFRESH_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for scheduled tasks
#[derive(Debug, Clone)]
pub struct ScheduledTaskConfig {
    pub refresh_check_interval: Duration,
    pub position_update_interval: Duration,
    /// Check the cache immediately instead of after the first interval
    pub perform_initial_update: bool,
}

impl Default for ScheduledTaskConfig {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for ScheduledTaskConfig {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            refresh_check_interval: Duration::from_secs(config.refresh_check_interval_secs.max(1)),
            position_update_interval: Duration::from_secs(
                config.position_update_interval_secs.max(1),
            ),
            perform_initial_update: config.perform_initial_update,
        }
    }
}

/// Scheduled task manager
pub struct ScheduledTaskManager {
    config: ScheduledTaskConfig,
    service: Arc<SatelliteService>,
    task_handles: Vec<JoinHandle<()>>,
}

impl ScheduledTaskManager {
    pub fn new(config: ScheduledTaskConfig, service: Arc<SatelliteService>) -> Self {
        Self {
            config,
            service,
            task_handles: Vec::new(),
        }
    }

    /// Start all scheduled tasks
    pub fn start_all(&mut self) {
        tracing::info!("Starting scheduled task manager...");

        let refresh_handle = self.start_refresh_check_task();
        self.task_handles.push(refresh_handle);

        let position_handle = self.start_position_update_task();
        self.task_handles.push(position_handle);

        tracing::info!(
            "Started {} scheduled tasks (refresh check every {}s, positions every {}s)",
            self.task_handles.len(),
            self.config.refresh_check_interval.as_secs(),
            self.config.position_update_interval.as_secs()
        );
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    fn start_refresh_check_task(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let period = self.config.refresh_check_interval;
        let perform_initial = self.config.perform_initial_update;

        tokio::spawn(async move {
            let mut ticker = if perform_initial {
                tokio::time::interval(period)
            } else {
                tokio::time::interval_at(tokio::time::Instant::now() + period, period)
            };
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                Self::run_refresh_check(&service).await;
            }
        })
    }

    async fn run_refresh_check(service: &SatelliteService) {
        match tokio::time::timeout(REFRESH_TIMEOUT, service.refresh_if_stale()).await {
            Ok(Ok(Some(report))) => tracing::info!(
                "Scheduled refresh #{}: {} records ({} new, {} updated)",
                report.generation,
                report.fetched,
                report.inserted,
                report.updated
            ),
            Ok(Ok(None)) => tracing::trace!("Element cache is fresh"),
            Ok(Err(RefreshError::Superseded(generation))) => {
                tracing::debug!("Scheduled refresh #{} superseded", generation)
            }
            Ok(Err(e)) => tracing::error!("Scheduled refresh failed: {}", e),
            Err(_) => tracing::error!(
                "Scheduled refresh timed out after {} seconds",
                REFRESH_TIMEOUT.as_secs()
            ),
        }
    }

    fn start_position_update_task(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let period = self.config.position_update_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                // Failures are logged by the service
                if let Ok(batch) = service.request_filtered_update().await {
                    tracing::debug!("Scheduled position update: {} positions", batch.len());
                }
            }
        })
    }

    /// Gracefully shutdown all tasks
    pub async fn shutdown(self) {
        tracing::info!("Shutting down scheduled task manager...");

        for handle in self.task_handles {
            handle.abort();
            let _ = handle.await;
        }

        tracing::info!("All scheduled tasks stopped");
    }
}
