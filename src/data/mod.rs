//! Export-side handling of completed scan volumes.

pub mod storage;

pub use storage::DiscardSink;
#[cfg(feature = "storage_csv")]
pub use storage::CsvVolumeWriter;
