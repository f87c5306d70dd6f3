//! # Near-Field Scanner Core
//!
//! Orchestration core for a camera-guided near-field scanner: a motorized
//! rig that steps an RF probe over a printed-circuit board on a fixed grid
//! and records one instrument trace per grid point, producing a 3-D
//! (x, y, frequency) data volume for field-mapping analysis.
//!
//! The crate covers the scan pipeline only; presentation, wizards and
//! live video preview are external collaborators reached through the
//! capability traits in [`capabilities`].
//!
//! ## Crate Structure
//!
//! - **`calibration`**: the coordinate transform engine. A fixed-geometry
//!   pinhole model converting pixel measurements to millimeters and
//!   inferring board height from apparent image-scale change. Pure
//!   functions, unit-testable with numeric fixtures alone.
//! - **`capabilities`**: the seams. `Movable` (robot), `SweepSource`
//!   (spectrum analyzer / VNA), `FrameCapture` (image subsystem) and
//!   `TensorSink` (export path) as small async traits.
//! - **`channels`**: asynchronous byte-stream clients for the robot and
//!   the instruments, over type-erased streams so TCP links and simulated
//!   duplex streams share one protocol path. Wire framing lives in
//!   `channels::codec`.
//! - **`scan`**: the scan state machine, grid geometry (`scan::region`)
//!   and data tensor assembly (`scan::tensor`).
//! - **`config`**: TOML-backed [`config::Settings`]: endpoints, step
//!   sizes, settle delay and failure policy as data, not constants.
//! - **`data`**: export-side sinks for completed scan volumes.
//! - **`error`**: the [`error::ScanError`] taxonomy shared by every module.
//! - **`logging`**: `tracing` subscriber bootstrap for embedding
//!   applications.

pub mod calibration;
pub mod capabilities;
pub mod channels;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod scan;

pub use calibration::CalibrationModel;
pub use config::Settings;
pub use error::{ScanError, ScanResult};
pub use scan::{ScanEvent, ScanOutcome, ScanState, Scanner};
