///! Orbital element catalog management
///!
///! ## Main Components
///! - `OrbitalElementCache`: keyed element cache, write-through to a store
///! - `RefreshScheduler`: single-flight refresh from the remote catalog
///! - `JsonlStore` / `MemoryStore`: durable and volatile persistence

// ============ Core Data Structures ============
pub mod types;
pub use types::{CacheMetadata, CacheStats, PipelineEvent, PositionBatch, RefreshReport, RefreshStatus};

// ============ Persistence ============
pub mod store;
pub use store::{ElementStore, JsonlStore, MemoryStore, StoreSnapshot};

pub mod cache;
pub use cache::{MergeOutcome, OrbitalElementCache};

// ============ Remote Catalog ============
pub mod api_client;
pub use api_client::{CatalogFetcher, FetchPolicy, HttpCatalogFetcher};

pub mod parser;

pub mod updater;
pub use updater::{RefreshScheduler, RefreshSettings};

#[cfg(test)]
pub(crate) mod testing;
