//! Hardware and collaborator capability traits.
//!
//! Instead of one monolithic device trait, each seam gets a small focused
//! capability: the robot is [`Movable`], an analyzer is a [`SweepSource`],
//! the image-capture collaborator is a [`FrameCapture`], and the export
//! collaborator is a [`TensorSink`]. The scan machine only ever talks to
//! these traits, which is what lets every scenario test run against
//! simulated devices.
//!
//! Each capability trait:
//! - is async (`#[async_trait]`)
//! - is thread-safe (`Send + Sync`)
//! - returns [`ScanResult`] so link errors propagate with `?`

use crate::calibration::PixelRect;
use crate::error::ScanResult;
use crate::scan::tensor::ScanVolume;
use async_trait::async_trait;
use bytes::Bytes;
use nalgebra::{Point3, Vector3};

/// Motion control over the scanner robot.
#[async_trait]
pub trait Movable: Send + Sync {
    /// Drive all axes to their reference origin. Resolves once the robot
    /// reports motion complete.
    async fn home(&self) -> ScanResult<()>;

    /// Absolute move to a position in millimeters. Resolves once the move
    /// is acknowledged and the command queue has drained, i.e. the motion
    /// is settled from the protocol's point of view.
    async fn move_abs(&self, target_mm: Point3<f64>) -> ScanResult<()>;

    /// Relative move by a millimeter delta.
    async fn move_rel(&self, delta_mm: Vector3<f64>) -> ScanResult<()>;
}

/// One instrument sweep: the frequency axis and one amplitude per bin.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    /// Frequency of each bin, hertz.
    pub frequencies_hz: Vec<f64>,
    /// Amplitude of each bin, instrument units (typically dBm).
    pub amplitudes: Vec<f64>,
}

/// A sweep-capable RF instrument (spectrum analyzer or VNA).
#[async_trait]
pub trait SweepSource: Send + Sync {
    /// Trigger one sweep and read the resulting trace.
    ///
    /// Failure modes the scan loop distinguishes:
    /// - [`ScanError::InvalidTraceData`](crate::error::ScanError::InvalidTraceData):
    ///   malformed response, per-point
    /// - [`ScanError::LinkDropped`](crate::error::ScanError::LinkDropped) /
    ///   [`ScanError::LinkTimeout`](crate::error::ScanError::LinkTimeout):
    ///   counted toward the consecutive-failure threshold
    async fn trigger_sweep(&self) -> ScanResult<TraceFrame>;
}

/// One still capture plus whatever the vision stage detected in it.
#[derive(Debug, Clone)]
pub struct Capture {
    /// Raw image buffer as delivered by the capture subsystem.
    pub image: Bytes,
    /// Capture resolution, pixels.
    pub resolution_px: (u32, u32),
    /// Detected board outline, if the detector found one.
    pub board_rect_px: Option<PixelRect>,
    /// Apparent extent of the height-reference marker, pixels.
    pub marker_extent_px: Option<f64>,
}

/// One-shot still capture from the image subsystem.
///
/// The continuous preview stream stays outside the core; this trait is the
/// single request/response handoff the calibration states use.
#[async_trait]
pub trait FrameCapture: Send + Sync {
    /// Request one capture and its detection results.
    async fn capture(&self) -> ScanResult<Capture>;
}

/// Export collaborator: receives the completed scan volume by value.
#[async_trait]
pub trait TensorSink: Send + Sync {
    /// Persist one completed volume. Ownership transfers here; the scan
    /// machine keeps nothing.
    async fn persist(&mut self, volume: ScanVolume) -> ScanResult<()>;
}
