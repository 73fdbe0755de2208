pub mod conversion;
pub mod scheduled;
