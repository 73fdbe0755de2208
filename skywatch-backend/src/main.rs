use skywatch_backend::config;
use skywatch_backend::model::sat::{HttpCatalogFetcher, JsonlStore, PipelineEvent};
use skywatch_backend::module::conversion::Sgp4Propagator;
use skywatch_backend::module::scheduled::{ScheduledTaskConfig, ScheduledTaskManager};
use skywatch_backend::service::{SatelliteService, ServiceSettings};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = config::read_config(&config_path)?;

    // Initialize logging
    let _logging_guard = skywatch_backend::logging::init_logging(
        &config.log_dir,
        "skywatch-backend",
        &config.log_level,
    )?;

    tracing::info!("Skywatch backend starting...");
    tracing::info!("Catalog: {}", config.catalog.elements_url);

    let store = Arc::new(JsonlStore::new(&config.cache.data_dir));
    let fetcher = Arc::new(HttpCatalogFetcher::new(config.catalog.fetch_policy())?);
    let propagator = Arc::new(Sgp4Propagator::new(config.propagation.max_element_age()));

    let service = Arc::new(SatelliteService::new(
        store,
        fetcher,
        propagator,
        ServiceSettings {
            refresh: config.catalog.refresh_settings(),
            ttl: config.cache.ttl(),
        },
    ));

    let event_logger = tokio::spawn(log_events(service.subscribe()));

    match service.initialize().await {
        Ok(stats) => tracing::info!(
            "Element cache initialized: {} records, last sync {:?}",
            stats.records,
            stats.last_sync
        ),
        Err(e) if e.is_fatal() => {
            return Err(anyhow::Error::new(e).context("Failed to initialize the orbital element cache"));
        }
        // The refresh check task retries on its next tick
        Err(e) => tracing::error!("Initial catalog sync failed, continuing with an empty cache: {}", e),
    }

    // Configure and start scheduled tasks
    let mut task_manager = ScheduledTaskManager::new(
        ScheduledTaskConfig::from(&config.schedule),
        service.clone(),
    );
    task_manager.start_all();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    task_manager.shutdown().await;
    if let Err(e) = service.shutdown().await {
        tracing::warn!("Failed to compact element journal: {}", e);
    }
    event_logger.abort();

    tracing::info!("Skywatch backend stopped");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(PipelineEvent::RefreshProgress { generation, percent }) if percent % 25 == 0 => {
                tracing::info!("Refresh #{}: {}%", generation, percent);
            }
            Ok(PipelineEvent::PositionsPublished { run, count }) => {
                tracing::debug!("Positions run #{}: {} objects", run, count);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Event logger lagged by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
