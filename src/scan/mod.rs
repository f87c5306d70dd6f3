//! Scan orchestration.
//!
//! The [`Scanner`] sequences the whole run:
//!
//! ```text
//! Idle → Homing → AwaitingOrigin → MeasuringHeight → Ready → Scanning → Saving → Idle
//! ```
//!
//! with `Aborted` reachable from every non-terminal state via the stop
//! latch or a propagated link error. Within `Scanning`, each grid point
//! runs move → settle → acquire → advance with exactly one point in flight
//! at a time; points are visited in a fixed deterministic order because the
//! robot has real inertia and the instrument read must reflect the settled
//! position.
//!
//! The stop latch is only consulted at transition boundaries, never
//! mid-operation: an in-flight move or acquisition always completes (or
//! times out) first, so an abort can never leave the robot's command
//! parser desynchronized.

pub mod region;
pub mod tensor;

pub use region::ScanRegion;
pub use tensor::{DataTensor, ScanVolume, SENTINEL};

use crate::calibration::CalibrationModel;
use crate::capabilities::{FrameCapture, Movable, SweepSource, TensorSink};
use crate::config::ScanSettings;
use crate::error::{ScanError, ScanResult};
use crate::scan::tensor::CellOutcome;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

// =============================================================================
// States, progress, events
// =============================================================================

/// Current state of the scan machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Nothing in progress.
    Idle,
    /// Robot driving to its reference origin.
    Homing,
    /// Waiting for the calibration capture and board detection.
    AwaitingOrigin,
    /// Waiting for the height-reference capture.
    MeasuringHeight,
    /// Geometry finalized; a scan may start.
    Ready,
    /// Visiting grid points.
    Scanning,
    /// Handing the completed volume to the export path.
    Saving,
    /// Terminated early; re-arms to `Idle`.
    Aborted,
}

/// Grid counters for the active scan.
///
/// The scattered one-shot flags of older firmware (`first_part`,
/// `first_part_freq`) collapse into two places: the tensor latches
/// `sweep_points` from the first trace, and `frequency_axis_captured`
/// here latches the frequency axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridProgress {
    /// Current row.
    pub row: usize,
    /// Current column.
    pub column: usize,
    /// Linear index of the current point.
    pub index: usize,
    /// Whether the frequency axis has been captured this run.
    pub frequency_axis_captured: bool,
}

/// Progress snapshot published on the watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Machine state.
    pub state: ScanState,
    /// Grid counters.
    pub grid: GridProgress,
    /// Total grid points for the run (0 until `Ready`).
    pub total_points: usize,
    /// Completion percentage, 0.0–100.0.
    pub percent: f64,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            grid: GridProgress::default(),
            total_points: 0,
            percent: 0.0,
        }
    }
}

/// Events surfaced to the presentation layer.
///
/// Terminal events carry the error kind and the last-known grid position,
/// never raw protocol bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanEvent {
    /// The machine moved to a new state.
    StateChanged(ScanState),
    /// The measured board height, after `MeasuringHeight`.
    HeightMeasured {
        /// Board height above the reference plane, millimeters.
        height_mm: f64,
    },
    /// One grid point finished (successfully or as a sentinel cell).
    PointRecorded {
        /// Grid row.
        row: usize,
        /// Grid column.
        column: usize,
        /// Linear point index.
        index: usize,
        /// Completion percentage after this point.
        percent: f64,
    },
    /// A per-point problem that did not stop the scan.
    TraceWarning {
        /// Grid row.
        row: usize,
        /// Grid column.
        column: usize,
        /// What went wrong.
        message: String,
    },
    /// The scan completed and the volume was persisted.
    Finished {
        /// Rows recorded.
        rows: usize,
        /// Columns per row.
        columns: usize,
        /// Bins per cell.
        sweep_points: usize,
    },
    /// The run terminated early.
    Aborted {
        /// Machine-readable error kind (see [`ScanError::kind`]).
        kind: String,
        /// Human-readable reason.
        reason: String,
        /// Last grid point that was in flight, if any.
        last_point: Option<(usize, usize)>,
    },
}

/// How a scan run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every grid point visited and the volume persisted.
    Completed {
        /// Rows recorded.
        rows: usize,
        /// Columns per row.
        columns: usize,
        /// Bins per cell.
        sweep_points: usize,
    },
    /// Stopped on request; the in-flight point finished first.
    Stopped {
        /// Last grid point completed.
        last_point: Option<(usize, usize)>,
    },
}

/// Cloneable handle that requests a stop.
///
/// The latch is checked at transition boundaries only; the in-flight
/// operation always finishes naturally first.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request that the scan stop at the next boundary.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Scanner
// =============================================================================

/// Orchestrates calibration and scanning over the capability seams.
pub struct Scanner {
    calibration: CalibrationModel,
    settings: ScanSettings,
    robot: Arc<dyn Movable>,
    instrument: Arc<dyn SweepSource>,
    camera: Arc<dyn FrameCapture>,
    state: ScanState,
    region: Option<ScanRegion>,
    stop: StopHandle,
    progress_tx: watch::Sender<ScanProgress>,
    events_tx: mpsc::UnboundedSender<ScanEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ScanEvent>>,
}

impl Scanner {
    /// Build a scanner over already-connected collaborators.
    pub fn new(
        calibration: CalibrationModel,
        settings: ScanSettings,
        robot: Arc<dyn Movable>,
        instrument: Arc<dyn SweepSource>,
        camera: Arc<dyn FrameCapture>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(ScanProgress::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            calibration,
            settings,
            robot,
            instrument,
            camera,
            state: ScanState::Idle,
            region: None,
            stop: StopHandle::default(),
            progress_tx,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Current machine state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Geometry resolved by the last calibration, if any.
    pub fn region(&self) -> Option<&ScanRegion> {
        self.region.as_ref()
    }

    /// Subscribe to progress snapshots.
    pub fn progress_rx(&self) -> watch::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ScanEvent>> {
        self.events_rx.take()
    }

    /// Handle for requesting a stop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn set_state(&mut self, state: ScanState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "scan state");
            self.state = state;
            let _ = self.events_tx.send(ScanEvent::StateChanged(state));
            self.progress_tx.send_modify(|p| p.state = state);
        }
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Emit the terminal abort event and re-arm the machine.
    fn abort(&mut self, kind: &str, reason: String, last_point: Option<(usize, usize)>) {
        warn!(kind, reason = %reason, ?last_point, "scan aborted");
        self.set_state(ScanState::Aborted);
        self.emit(ScanEvent::Aborted {
            kind: kind.to_string(),
            reason,
            last_point,
        });
        self.set_state(ScanState::Idle);
    }

    fn abort_on(&mut self, err: ScanError, last_point: Option<(usize, usize)>) -> ScanError {
        self.abort(err.kind(), err.to_string(), last_point);
        err
    }

    fn check_stop(&self) -> bool {
        self.stop.is_stopped()
    }

    // -------------------------------------------------------------------------
    // Calibration sequence
    // -------------------------------------------------------------------------

    /// Run the calibration sequence: home the robot, detect the board
    /// origin, measure the board height. Ends in `Ready`.
    ///
    /// A missing height marker leaves the machine in `Ready` with the
    /// configured probe height and returns
    /// [`ScanError::HeightMeasurement`]; the caller may retry or scan at
    /// the configured height. A missing board detection is
    /// [`ScanError::InvalidCalibration`] and returns the machine to
    /// `Idle`; re-running `calibrate` retries the capture.
    pub async fn calibrate(&mut self) -> ScanResult<()> {
        if !matches!(self.state, ScanState::Idle | ScanState::Ready) {
            return Err(ScanError::InvalidState(format!(
                "calibrate requested while {:?}",
                self.state
            )));
        }
        self.stop.reset();

        self.set_state(ScanState::Homing);
        if let Err(e) = self.robot.home().await {
            return Err(self.abort_on(e, None));
        }

        if self.check_stop() {
            self.abort("stopped", "stop requested".to_string(), None);
            return Err(ScanError::InvalidState("stopped during calibration".to_string()));
        }

        self.set_state(ScanState::AwaitingOrigin);
        let capture = match self.camera.capture().await {
            Ok(c) => c,
            Err(e) => return Err(self.abort_on(e, None)),
        };
        let Some(board_rect) = capture.board_rect_px else {
            self.set_state(ScanState::Idle);
            return Err(ScanError::InvalidCalibration(
                "no board outline detected in calibration capture".to_string(),
            ));
        };
        let region = ScanRegion::from_detection(
            &self.calibration,
            board_rect,
            self.settings.probe_height_mm,
            self.settings.step_xy_mm,
            self.settings.step_z_mm,
        );
        let mut region = match region {
            Ok(r) => r,
            Err(e) => {
                self.set_state(ScanState::Idle);
                return Err(e);
            }
        };

        self.set_state(ScanState::MeasuringHeight);
        let height_result = self.measure_height(&mut region).await;
        self.region = Some(region);
        self.set_state(ScanState::Ready);

        match height_result {
            Ok(height_mm) => {
                self.emit(ScanEvent::HeightMeasured { height_mm });
                info!(height_mm, "board height measured");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "height measurement failed; keeping configured probe height");
                Err(e)
            }
        }
    }

    async fn measure_height(&mut self, region: &mut ScanRegion) -> ScanResult<f64> {
        let capture = self.camera.capture().await?;
        let Some(measured_extent) = capture.marker_extent_px else {
            return Err(ScanError::HeightMeasurement(
                "reference marker not detected".to_string(),
            ));
        };
        let reference_extent = self
            .calibration
            .mm_to_px(
                nalgebra::Vector2::new(self.settings.marker_width_mm, 0.0),
                self.calibration.camera_distance_2_mm,
            )?
            .x;
        let height_mm = self
            .calibration
            .height_from_scale(reference_extent, measured_extent)
            .map_err(|e| ScanError::HeightMeasurement(e.to_string()))?;
        region.apply_height(&self.calibration, height_mm)?;
        Ok(height_mm)
    }

    // -------------------------------------------------------------------------
    // Scan sequence
    // -------------------------------------------------------------------------

    /// Run the scan and hand the completed volume to `sink`.
    ///
    /// Requires `Ready`. Per-point instrument failures are absorbed as
    /// sentinel cells; the configured number of consecutive link failures
    /// aborts the run, as does any robot link error.
    pub async fn run(&mut self, sink: &mut dyn TensorSink) -> ScanResult<ScanOutcome> {
        if self.state != ScanState::Ready {
            return Err(ScanError::InvalidState(format!(
                "scan requested while {:?}",
                self.state
            )));
        }
        let region = match self.region.clone() {
            Some(r) => r,
            None => {
                return Err(ScanError::InvalidState(
                    "scan requested without a calibrated region".to_string(),
                ))
            }
        };

        self.stop.reset();
        let rows = region.rows();
        let columns = region.columns();
        let total = rows * columns;
        let started_at = Utc::now();
        let mut tensor = DataTensor::new();
        let mut grid = GridProgress::default();
        let mut consecutive_drops: u32 = 0;
        let mut last_point: Option<(usize, usize)> = None;

        self.progress_tx.send_modify(|p| {
            *p = ScanProgress {
                state: ScanState::Scanning,
                grid,
                total_points: total,
                percent: 0.0,
            };
        });
        self.set_state(ScanState::Scanning);
        info!(rows, columns, "scan started");

        for row in 0..rows {
            for visit in 0..columns {
                // Stop latch: boundary check only, never mid-operation.
                if self.check_stop() {
                    self.abort("stopped", "stop requested".to_string(), last_point);
                    return Ok(ScanOutcome::Stopped { last_point });
                }

                let column = region.column_at(row, visit, self.settings.traversal);
                grid.row = row;
                grid.column = column;
                grid.index = row * columns + visit;

                // Move: a robot failure is never scan-survivable.
                if let Err(e) = self.robot.move_abs(region.target_mm(row, column)).await {
                    return Err(self.abort_on(e, last_point));
                }

                // Settle: let mechanical vibration damp before measuring.
                tokio::time::sleep(self.settings.settle()).await;

                // Acquire.
                match self.instrument.trigger_sweep().await {
                    Ok(frame) => {
                        consecutive_drops = 0;
                        if !grid.frequency_axis_captured {
                            tensor.set_frequencies(frame.frequencies_hz);
                            grid.frequency_axis_captured = true;
                        }
                        match tensor.record(row, column, frame.amplitudes) {
                            Ok(CellOutcome::Complete) => {}
                            Ok(CellOutcome::Padded(n)) => self.emit(ScanEvent::TraceWarning {
                                row,
                                column,
                                message: format!("short trace: {n} bins padded"),
                            }),
                            Ok(CellOutcome::Truncated(n)) => self.emit(ScanEvent::TraceWarning {
                                row,
                                column,
                                message: format!("long trace: {n} bins dropped"),
                            }),
                            Ok(CellOutcome::Missing) => {}
                            Err(e) => return Err(self.abort_on(e, last_point)),
                        }
                    }
                    Err(e) if e.is_per_point() => {
                        let dropped_link = !matches!(e, ScanError::InvalidTraceData(_));
                        if dropped_link {
                            consecutive_drops += 1;
                        } else {
                            consecutive_drops = 0;
                        }
                        self.emit(ScanEvent::TraceWarning {
                            row,
                            column,
                            message: e.to_string(),
                        });
                        if let Err(overflow) = tensor.record_missing(row, column) {
                            return Err(self.abort_on(overflow, last_point));
                        }
                        if dropped_link && consecutive_drops >= self.settings.max_consecutive_drops
                        {
                            return Err(self.abort_on(e, Some((row, column))));
                        }
                    }
                    Err(e) => return Err(self.abort_on(e, last_point)),
                }

                // Advance.
                last_point = Some((row, column));
                let done = grid.index + 1;
                let percent = 100.0 * done as f64 / total.max(1) as f64;
                self.progress_tx.send_modify(|p| {
                    p.grid = grid;
                    p.percent = percent;
                });
                self.emit(ScanEvent::PointRecorded {
                    row,
                    column,
                    index: grid.index,
                    percent,
                });
            }
        }

        self.set_state(ScanState::Saving);
        let volume = match tensor.into_volume(&region, started_at) {
            Ok(v) => v,
            Err(e) => return Err(self.abort_on(e, last_point)),
        };
        let sweep_points = volume.sweep_points;
        if let Err(e) = sink.persist(volume).await {
            return Err(self.abort_on(e, last_point));
        }

        self.set_state(ScanState::Idle);
        self.emit(ScanEvent::Finished {
            rows,
            columns,
            sweep_points,
        });
        info!(rows, columns, "scan finished");
        Ok(ScanOutcome::Completed {
            rows,
            columns,
            sweep_points,
        })
    }
}
