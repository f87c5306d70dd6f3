//! Configuration management.
//!
//! Settings are loaded from TOML files under `config/` via the `config`
//! crate and validated semantically before use. Endpoints, step sizes and
//! timing constants all live here rather than as compiled-in constants, so
//! the same binary drives a bench rig, a production rig, or a fully
//! simulated test setup.

use crate::calibration::CalibrationModel;
use crate::error::{ScanError, ScanResult};
use config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level application settings.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Log filter directive (e.g. "info", "nearfield_scanner=debug").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Robot motion controller endpoint.
    pub robot: Endpoint,
    /// Spectrum analyzer endpoint.
    pub spectrum: Endpoint,
    /// Vector network analyzer endpoint, if fitted.
    pub vna: Option<Endpoint>,
    /// Camera pinhole calibration constants for this rig.
    pub calibration: CalibrationModel,
    /// Scan geometry and timing.
    pub scan: ScanSettings,
    /// Storage destination for completed volumes.
    pub storage: StorageSettings,
}

/// A fixed-format host + numeric port pair for one device link.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or dotted address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Render as a `host:port` connect string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Grid geometry, timing and failure policy for a scan run.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanSettings {
    /// Step between grid points in X and Y, millimeters.
    #[serde(default = "default_step_xy")]
    pub step_xy_mm: f64,
    /// Step between scan planes in Z, millimeters.
    #[serde(default = "default_step_z")]
    pub step_z_mm: f64,
    /// Probe height above the board when no measured height is available,
    /// millimeters.
    #[serde(default = "default_probe_height")]
    pub probe_height_mm: f64,
    /// Physical width of the height-reference marker, millimeters.
    #[serde(default = "default_marker_width")]
    pub marker_width_mm: f64,
    /// Wait after motion-complete before triggering an acquisition.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Per-command device response timeout.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Column visit order within a row.
    #[serde(default)]
    pub traversal: Traversal,
    /// Consecutive instrument link failures tolerated before aborting.
    #[serde(default = "default_max_consecutive_drops")]
    pub max_consecutive_drops: u32,
}

/// Column traversal policy across rows.
///
/// Raster restarts every row at column zero; serpentine mirrors odd rows so
/// the probe never makes the long return move. Row order is identical in
/// both.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Traversal {
    /// Every row visits columns left to right.
    #[default]
    Raster,
    /// Odd rows visit columns right to left.
    Serpentine,
}

/// Destination for persisted scan volumes.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageSettings {
    /// Target folder for exported volumes.
    pub default_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_step_xy() -> f64 {
    10.0
}
fn default_step_z() -> f64 {
    5.0
}
fn default_probe_height() -> f64 {
    10.0
}
fn default_marker_width() -> f64 {
    10.0
}
fn default_settle_ms() -> u64 {
    400
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_max_consecutive_drops() -> u32 {
    3
}

impl ScanSettings {
    /// Settle delay as a [`Duration`].
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Settings {
    /// Load settings from `config/{name}.toml` (default: `config/default`).
    pub fn new(config_name: Option<&str>) -> ScanResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from an in-memory TOML string (used by tests and
    /// embedding applications that manage their own files).
    pub fn from_toml(text: &str) -> ScanResult<Self> {
        let s = Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization checks.
    pub fn validate(&self) -> ScanResult<()> {
        for (name, ep) in [("robot", &self.robot), ("spectrum", &self.spectrum)]
            .into_iter()
            .chain(self.vna.iter().map(|ep| ("vna", ep)))
        {
            if ep.host.trim().is_empty() {
                return Err(ScanError::Configuration(format!("{name} host is empty")));
            }
            if ep.port == 0 {
                return Err(ScanError::Configuration(format!("{name} port is zero")));
            }
        }
        if !(self.scan.step_xy_mm > 0.0) || !(self.scan.step_z_mm > 0.0) {
            return Err(ScanError::Configuration(
                "step sizes must be positive".to_string(),
            ));
        }
        if !(self.scan.marker_width_mm > 0.0) {
            return Err(ScanError::Configuration(
                "marker_width_mm must be positive".to_string(),
            ));
        }
        if self.scan.max_consecutive_drops == 0 {
            return Err(ScanError::Configuration(
                "max_consecutive_drops must be at least 1".to_string(),
            ));
        }
        if self.storage.default_path.trim().is_empty() {
            return Err(ScanError::Configuration(
                "storage.default_path is empty".to_string(),
            ));
        }
        self.calibration.validate()
    }
}
