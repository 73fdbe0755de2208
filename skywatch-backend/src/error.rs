///! Error taxonomy for the satellite pipeline
///!
///! Nothing here is fatal to the process: fetch failures are retried and
///! surfaced, malformed entries and propagation failures are skipped, and
///! everything else is returned to the caller as a typed result.

use std::path::PathBuf;
use thiserror::Error;

/// Remote catalog fetch failed
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no connectivity to {url} after {attempts} attempts: {last_error}")]
    NoConnectivity {
        url: String,
        attempts: u32,
        last_error: String,
    },
}

/// A single catalog entry could not be parsed; the entry is skipped
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("malformed element set near line {line}: {reason}")]
    MalformedElementSet { line: usize, reason: String },

    #[error("malformed catalog metadata entry #{index}: {reason}")]
    MalformedMetadata { index: usize, reason: String },

    #[error("invalid selector '{0}'")]
    Selector(String),
}

/// Durable store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store entry: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Orbital element cache failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("catalog id '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl CacheError {
    /// Only a broken store is fatal at startup. Lookup and refresh failures
    /// leave the cache usable and the next scheduled check retries.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Store(_))
    }
}

/// Refresh cycle failure
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    NoConnectivity(#[from] FetchError),

    #[error("refresh #{0} was superseded by a newer request")]
    Superseded(u64),

    /// The response held no usable element set (error page, empty body)
    #[error("catalog response held no valid element sets ({skipped_malformed} malformed)")]
    EmptyCatalog { skipped_malformed: usize },

    #[error("failed to persist refreshed elements: {0}")]
    Store(#[from] StoreError),
}

/// Propagation failed for one object; the object is skipped for this run
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PropagationError {
    #[error("stale element set for {catalog_id}: {reason}")]
    StaleElements { catalog_id: String, reason: String },

    #[error("invalid element set for {catalog_id}: {reason}")]
    InvalidElements { catalog_id: String, reason: String },
}

/// Conversion pipeline run failure
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A newer run started before this one could publish
    #[error("conversion run #{0} was superseded")]
    Superseded(u64),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("conversion task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl PipelineError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, PipelineError::Superseded(_))
    }
}
