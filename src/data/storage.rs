//! Scan volume storage writers.
//!
//! The export collaborator owns the on-disk format; these writers cover
//! the common cases. `CsvVolumeWriter` emits a long-format table (one
//! record per row/column/frequency bin) with the scan geometry as a
//! `#`-prefixed JSON header, which downstream field-mapping tools ingest
//! directly. `DiscardSink` swallows volumes for headless tests and for
//! applications that persist elsewhere.

use crate::capabilities::TensorSink;
#[cfg(feature = "storage_csv")]
use crate::error::ScanError;
use crate::error::ScanResult;
use crate::scan::tensor::ScanVolume;
use async_trait::async_trait;
#[cfg(feature = "storage_csv")]
use std::path::PathBuf;
use tracing::info;

/// Sink that drops the volume (tests, external persistence).
#[derive(Debug, Default)]
pub struct DiscardSink {
    volumes_seen: usize,
}

impl DiscardSink {
    /// New discarding sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many volumes were handed to this sink.
    pub fn volumes_seen(&self) -> usize {
        self.volumes_seen
    }
}

#[async_trait]
impl TensorSink for DiscardSink {
    async fn persist(&mut self, volume: ScanVolume) -> ScanResult<()> {
        self.volumes_seen += 1;
        info!(
            rows = volume.row_count(),
            columns = volume.column_count(),
            sweep_points = volume.sweep_points,
            "scan volume discarded by sink"
        );
        Ok(())
    }
}

/// CSV writer for completed scan volumes.
#[cfg(feature = "storage_csv")]
pub struct CsvVolumeWriter {
    dir: PathBuf,
    last_path: Option<PathBuf>,
}

#[cfg(feature = "storage_csv")]
impl CsvVolumeWriter {
    /// Writer targeting the given folder; created on first persist if
    /// missing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_path: None,
        }
    }

    /// Path of the most recently written volume.
    pub fn last_path(&self) -> Option<&std::path::Path> {
        self.last_path.as_deref()
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl TensorSink for CsvVolumeWriter {
    async fn persist(&mut self, volume: ScanVolume) -> ScanResult<()> {
        use std::io::Write;

        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .map_err(|e| ScanError::Storage(format!("failed to create target folder: {e}")))?;
        }
        let file_name = format!(
            "scan_{}.csv",
            volume.completed_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(file_name);

        let mut file = std::fs::File::create(&path)
            .map_err(|e| ScanError::Storage(format!("failed to create CSV file: {e}")))?;

        // Geometry and axes ride along as a commented JSON header.
        let header = serde_json::json!({
            "region": volume.region,
            "frequencies_hz": volume.frequencies_hz,
            "sweep_points": volume.sweep_points,
            "started_at": volume.started_at,
            "completed_at": volume.completed_at,
        });
        let json_string = serde_json::to_string_pretty(&header)
            .map_err(|e| ScanError::Storage(e.to_string()))?;
        for line in json_string.lines() {
            writeln!(file, "# {line}").map_err(|e| ScanError::Storage(e.to_string()))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(["row", "column", "x_mm", "y_mm", "frequency_hz", "amplitude"])
            .map_err(|e| ScanError::Storage(e.to_string()))?;

        for (r, row) in volume.rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                let target = volume.region.target_mm(r, c);
                for (bin, amplitude) in cell.iter().enumerate() {
                    let freq = volume
                        .frequencies_hz
                        .get(bin)
                        .copied()
                        .unwrap_or(f64::NAN);
                    writer
                        .write_record([
                            r.to_string(),
                            c.to_string(),
                            format!("{:.3}", target.x),
                            format!("{:.3}", target.y),
                            format!("{freq}"),
                            format!("{amplitude}"),
                        ])
                        .map_err(|e| ScanError::Storage(e.to_string()))?;
                }
            }
        }
        writer
            .flush()
            .map_err(|e| ScanError::Storage(e.to_string()))?;

        info!(path = %path.display(), "scan volume written");
        self.last_path = Some(path);
        Ok(())
    }
}
