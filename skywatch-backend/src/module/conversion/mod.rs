///! Position conversion
///!
///! - `propagator`: orbital elements -> Earth-fixed Cartesian position
///! - `geodetic`: Cartesian position -> latitude/longitude
///! - `pipeline`: cancellable producer/consumer runs over the cache

pub mod filter;
pub use filter::{match_all, RecordPredicate, SatelliteFilter};

pub mod geodetic;
pub use geodetic::Ellipsoid;

pub mod propagator;
pub use propagator::{Propagator, Sgp4Propagator};

pub mod pipeline;
pub use pipeline::ConversionPipeline;
