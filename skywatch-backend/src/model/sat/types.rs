use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skywatch_common::DisplayPosition;

/// Cache-wide metadata (one row per cache)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Last successful full refresh; never moves backwards
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    /// Whether the cache is older than `ttl`. A cache that was never synced
    /// is always stale.
    pub fn is_stale(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_sync {
            Some(last_sync) => now.signed_duration_since(last_sync) >= ttl,
            None => true,
        }
    }
}

/// Summary returned by cache initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub records: usize,
    pub favorites: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// Outcome of one completed refresh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub generation: u64,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_malformed: usize,
    pub full_rebuild: bool,
    pub duration_seconds: f64,
}

/// Point-in-time view of the refresh scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub in_flight: bool,
    pub percent: usize,
    pub records: usize,
}

/// Immutable result of one conversion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionBatch {
    /// Generation of the run that produced this batch (0 = nothing yet)
    pub run: u64,
    pub epoch: DateTime<Utc>,
    pub positions: Vec<DisplayPosition>,
}

impl PositionBatch {
    pub fn empty(run: u64, epoch: DateTime<Utc>) -> Self {
        Self {
            run,
            epoch,
            positions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Notifications delivered to the UI collaborator over the service's
/// broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RefreshStarted { generation: u64 },
    RefreshProgress { generation: u64, percent: usize },
    RefreshCompleted { report: RefreshReport },
    RefreshFailed { generation: u64, reason: String },
    PositionsPublished { run: u64, count: usize },
}
