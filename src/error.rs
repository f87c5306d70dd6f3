//! Custom error types for the scanner core.
//!
//! This module defines the primary error type, `ScanError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a scan run can
//! encounter, from bad calibration inputs to dropped device links.
//!
//! ## Error Taxonomy
//!
//! - **`InvalidCalibration`**: the coordinate transform was asked to work
//!   with inputs that make the pinhole projection undefined (zero focal
//!   length, zero resolution, non-finite values). Fatal to the calibration
//!   step; recoverable by retrying the capture.
//! - **`HeightMeasurement`**: the reference marker used to infer the board
//!   height was not found in the calibration capture. Recoverable; the scan
//!   does not start.
//! - **`InvalidTraceData`**: an instrument returned a malformed trace.
//!   Per-point and non-fatal; the affected cell is recorded as sentinel
//!   values and the scan continues.
//! - **`LinkTimeout` / `LinkDropped`**: a device link stopped answering or
//!   closed. Escalates to an aborted scan once the configured
//!   consecutive-failure threshold is reached (immediately for the robot).
//! - **`GridOverflow`**: the tensor was handed a cell outside the expected
//!   visit order. Always fatal, since it means the row/column bookkeeping is
//!   wrong, so it is logged loudly and never absorbed.
//! - **`InvalidState`**: an operation was requested while the scan machine
//!   was in a state that cannot serve it.
//! - **`Config` / `Configuration`**: file-level parse errors from the
//!   `config` crate vs. semantic validation failures (a zero step size
//!   parses fine but is still wrong).

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Errors produced by the scanner core.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Pinhole projection inputs were invalid (zero focal length or
    /// resolution, non-finite values).
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    /// The height-reference marker was not found in the capture.
    #[error("height measurement failed: {0}")]
    HeightMeasurement(String),

    /// An instrument returned a trace that could not be parsed.
    #[error("invalid trace data: {0}")]
    InvalidTraceData(String),

    /// A device did not answer within the configured command timeout.
    #[error("link timeout on {device}")]
    LinkTimeout {
        /// Which device link timed out.
        device: String,
    },

    /// A device link closed or failed at the I/O level.
    #[error("link dropped on {device}")]
    LinkDropped {
        /// Which device link dropped.
        device: String,
    },

    /// A tensor cell arrived outside the expected visit order.
    #[error("grid overflow at row {row}, column {column}")]
    GridOverflow {
        /// Row index of the offending cell.
        row: usize,
        /// Column index of the offending cell.
        column: usize,
    },

    /// An operation required an open link but the device is disconnected.
    #[error("device link not connected")]
    NotConnected,

    /// The scan machine cannot serve this request from its current state.
    #[error("invalid scan state: {0}")]
    InvalidState(String),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure outside a device link (e.g. the export path).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisting the completed scan volume failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ScanError {
    /// Whether the failure is scoped to a single grid point.
    ///
    /// Per-point failures are absorbed by the scan loop (the cell is
    /// recorded as sentinel values); everything else forces an abort.
    pub fn is_per_point(&self) -> bool {
        matches!(
            self,
            ScanError::InvalidTraceData(_)
                | ScanError::LinkTimeout { .. }
                | ScanError::LinkDropped { .. }
        )
    }

    /// Short machine-readable kind tag, used in terminal scan events.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::InvalidCalibration(_) => "invalid_calibration",
            ScanError::HeightMeasurement(_) => "height_measurement",
            ScanError::InvalidTraceData(_) => "invalid_trace_data",
            ScanError::LinkTimeout { .. } => "link_timeout",
            ScanError::LinkDropped { .. } => "link_dropped",
            ScanError::GridOverflow { .. } => "grid_overflow",
            ScanError::NotConnected => "not_connected",
            ScanError::InvalidState(_) => "invalid_state",
            ScanError::Config(_) => "config",
            ScanError::Configuration(_) => "configuration",
            ScanError::Io(_) => "io",
            ScanError::Storage(_) => "storage",
        }
    }
}
