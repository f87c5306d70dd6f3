//! End-to-end scan scenarios against simulated hardware.
//!
//! The mocks implement the capability traits directly, so these tests
//! exercise the full calibrate/run sequencing (state transitions, grid
//! ordering, settle timing, per-point failure policy) without any byte
//! streams. All timing-sensitive tests run on the paused clock.

use async_trait::async_trait;
use bytes::Bytes;
use nalgebra::{Point3, Vector3};
use nearfield_scanner::calibration::{CalibrationModel, PixelRect};
use nearfield_scanner::capabilities::{
    Capture, FrameCapture, Movable, SweepSource, TensorSink, TraceFrame,
};
use nearfield_scanner::config::{ScanSettings, Traversal};
use nearfield_scanner::error::{ScanError, ScanResult};
use nearfield_scanner::scan::tensor::ScanVolume;
use nearfield_scanner::scan::{ScanEvent, ScanOutcome, ScanState, Scanner};
use nalgebra::{Point2, Vector2};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

const SWEEP_POINTS: usize = 5;

// =============================================================================
// Mock hardware
// =============================================================================

#[derive(Clone, Default)]
struct Timeline(Arc<Mutex<Vec<(String, Instant)>>>);

impl Timeline {
    fn mark(&self, label: impl Into<String>) {
        self.0.lock().unwrap().push((label.into(), Instant::now()));
    }

    fn entries(&self) -> Vec<(String, Instant)> {
        self.0.lock().unwrap().clone()
    }
}

struct MockRobot {
    timeline: Timeline,
    targets: Arc<Mutex<Vec<Point3<f64>>>>,
    fail_at_move: Option<usize>,
}

impl MockRobot {
    fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            targets: Arc::new(Mutex::new(Vec::new())),
            fail_at_move: None,
        }
    }

    fn failing_at(timeline: Timeline, index: usize) -> Self {
        Self {
            fail_at_move: Some(index),
            ..Self::new(timeline)
        }
    }
}

#[async_trait]
impl Movable for MockRobot {
    async fn home(&self) -> ScanResult<()> {
        self.timeline.mark("home");
        Ok(())
    }

    async fn move_abs(&self, target_mm: Point3<f64>) -> ScanResult<()> {
        let mut targets = self.targets.lock().unwrap();
        if self.fail_at_move == Some(targets.len()) {
            return Err(ScanError::LinkDropped {
                device: "robot".to_string(),
            });
        }
        targets.push(target_mm);
        drop(targets);
        self.timeline.mark("move");
        Ok(())
    }

    async fn move_rel(&self, _delta_mm: Vector3<f64>) -> ScanResult<()> {
        self.timeline.mark("move_rel");
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum SweepAction {
    Full,
    Short(usize),
    Malformed,
    Drop,
}

struct MockSweep {
    timeline: Timeline,
    calls: Mutex<usize>,
    actions: Mutex<Vec<(usize, SweepAction)>>,
    stop_at: Mutex<Option<(usize, nearfield_scanner::scan::StopHandle)>>,
}

impl MockSweep {
    fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            calls: Mutex::new(0),
            actions: Mutex::new(Vec::new()),
            stop_at: Mutex::new(None),
        }
    }

    fn with_action(self, call: usize, action: SweepAction) -> Self {
        self.actions.lock().unwrap().push((call, action));
        self
    }

    fn stop_on_call(&self, call: usize, handle: nearfield_scanner::scan::StopHandle) {
        *self.stop_at.lock().unwrap() = Some((call, handle));
    }

    fn frame() -> TraceFrame {
        TraceFrame {
            frequencies_hz: (1..=SWEEP_POINTS).map(|i| i as f64 * 1.0e9).collect(),
            amplitudes: (0..SWEEP_POINTS).map(|i| -10.0 - i as f64).collect(),
        }
    }
}

#[async_trait]
impl SweepSource for MockSweep {
    async fn trigger_sweep(&self) -> ScanResult<TraceFrame> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let c = *calls;
            *calls += 1;
            c
        };
        self.timeline.mark(format!("sweep {call}"));

        if let Some((at, handle)) = self.stop_at.lock().unwrap().as_ref() {
            if *at == call {
                handle.stop();
            }
        }

        let action = self
            .actions
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| *c == call)
            .map(|(_, a)| *a)
            .unwrap_or(SweepAction::Full);

        match action {
            SweepAction::Full => Ok(Self::frame()),
            SweepAction::Short(n) => {
                let mut frame = Self::frame();
                frame.amplitudes.truncate(n);
                frame.frequencies_hz.truncate(n);
                Ok(frame)
            }
            SweepAction::Malformed => Err(ScanError::InvalidTraceData(
                "record 0: bad amplitude".to_string(),
            )),
            SweepAction::Drop => Err(ScanError::LinkDropped {
                device: "spectrum".to_string(),
            }),
        }
    }
}

struct MockCamera {
    captures: Mutex<VecDeque<Capture>>,
    fallback: Capture,
}

impl MockCamera {
    fn with_board_and_marker() -> Self {
        Self {
            captures: Mutex::new(VecDeque::new()),
            fallback: board_capture(Some(100.0)),
        }
    }

    fn without_marker() -> Self {
        Self {
            captures: Mutex::new(VecDeque::new()),
            fallback: board_capture(None),
        }
    }

    fn blind() -> Self {
        let mut capture = board_capture(None);
        capture.board_rect_px = None;
        Self {
            captures: Mutex::new(VecDeque::new()),
            fallback: capture,
        }
    }
}

fn board_capture(marker_extent_px: Option<f64>) -> Capture {
    Capture {
        image: Bytes::new(),
        resolution_px: (1000, 1000),
        board_rect_px: Some(PixelRect {
            origin: Point2::new(0.0, 0.0),
            size: Vector2::new(1000.0, 600.0),
        }),
        marker_extent_px,
    }
}

#[async_trait]
impl FrameCapture for MockCamera {
    async fn capture(&self) -> ScanResult<Capture> {
        let queued = self.captures.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| self.fallback.clone()))
    }
}

#[derive(Default)]
struct CapturingSink {
    volume: Option<ScanVolume>,
}

#[async_trait]
impl TensorSink for CapturingSink {
    async fn persist(&mut self, volume: ScanVolume) -> ScanResult<()> {
        self.volume = Some(volume);
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// 0.01 mm/px pitch; at the 100 mm standoff one pixel is 0.1 mm, so the
/// 1000x600 px board rectangle projects to exactly 100 x 60 mm.
fn calibration() -> CalibrationModel {
    CalibrationModel {
        sensor_width_mm: 10.0,
        sensor_height_mm: 10.0,
        focal_length_mm: 10.0,
        resolution_width_px: 1000.0,
        resolution_height_px: 1000.0,
        camera_distance_mm: 100.0,
        camera_distance_2_mm: 100.0,
    }
}

fn settings(step_mm: f64) -> ScanSettings {
    ScanSettings {
        step_xy_mm: step_mm,
        step_z_mm: 5.0,
        probe_height_mm: 0.0,
        marker_width_mm: 10.0,
        settle_ms: 400,
        command_timeout_ms: 1000,
        traversal: Traversal::Raster,
        max_consecutive_drops: 3,
    }
}

struct Rig {
    scanner: Scanner,
    robot: Arc<MockRobot>,
    sweep: Arc<MockSweep>,
    timeline: Timeline,
}

fn rig<F>(settings: ScanSettings, camera: MockCamera, make_sweep: F) -> Rig
where
    F: FnOnce(Timeline) -> MockSweep,
{
    let timeline = Timeline::default();
    let robot = Arc::new(MockRobot::new(timeline.clone()));
    let sweep = Arc::new(make_sweep(timeline.clone()));
    let scanner = Scanner::new(
        calibration(),
        settings,
        robot.clone(),
        sweep.clone(),
        Arc::new(camera),
    );
    Rig {
        scanner,
        robot,
        sweep,
        timeline,
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn full_scan_produces_rectangular_volume() {
    let mut r = rig(
        settings(10.0),
        MockCamera::with_board_and_marker(),
        MockSweep::new,
    );

    r.scanner.calibrate().await.unwrap();
    assert_eq!(r.scanner.state(), ScanState::Ready);
    let region = r.scanner.region().unwrap();
    assert_eq!(region.rows(), 6);
    assert_eq!(region.columns(), 10);

    let mut sink = CapturingSink::default();
    let outcome = r.scanner.run(&mut sink).await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Completed {
            rows: 6,
            columns: 10,
            sweep_points: SWEEP_POINTS
        }
    );
    assert_eq!(r.scanner.state(), ScanState::Idle);

    let volume = sink.volume.unwrap();
    assert_eq!(volume.rows.len(), 6);
    assert!(volume
        .rows
        .iter()
        .all(|row| row.len() == 10 && row.iter().all(|cell| cell.len() == SWEEP_POINTS)));
    assert_eq!(volume.frequencies_hz.len(), SWEEP_POINTS);
}

#[tokio::test(start_paused = true)]
async fn acquisition_waits_for_the_settle_timer() {
    let mut r = rig(
        settings(20.0),
        MockCamera::with_board_and_marker(),
        MockSweep::new,
    );
    let settle = std::time::Duration::from_millis(400);

    r.scanner.calibrate().await.unwrap();
    let mut sink = CapturingSink::default();
    r.scanner.run(&mut sink).await.unwrap();

    // Every sweep must trail its move by at least the settle delay, and
    // moves/sweeps must strictly alternate: one point in flight at a time.
    let entries = r.timeline.entries();
    let scan_entries: Vec<_> = entries
        .iter()
        .filter(|(label, _)| label == "move" || label.starts_with("sweep"))
        .collect();
    assert!(!scan_entries.is_empty());
    for pair in scan_entries.chunks(2) {
        let [(move_label, move_at), (sweep_label, sweep_at)] = pair else {
            panic!("unpaired timeline entry: {pair:?}");
        };
        assert_eq!(move_label, "move");
        assert!(sweep_label.starts_with("sweep"));
        assert!(
            sweep_at.duration_since(*move_at) >= settle,
            "sweep fired {:?} after move, settle is {:?}",
            sweep_at.duration_since(*move_at),
            settle
        );
    }
}

#[tokio::test(start_paused = true)]
async fn truncated_trace_pads_cell_and_scan_continues() {
    // Raster over 10 columns: call 23 is grid point (2, 3).
    let mut r = rig(settings(10.0), MockCamera::with_board_and_marker(), |tl| {
        MockSweep::new(tl).with_action(23, SweepAction::Short(SWEEP_POINTS - 1))
    });

    r.scanner.calibrate().await.unwrap();
    let mut events = r.scanner.take_events().unwrap();
    let mut sink = CapturingSink::default();
    let outcome = r.scanner.run(&mut sink).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Completed { .. }));

    let volume = sink.volume.unwrap();
    let cell = &volume.rows[2][3];
    assert_eq!(cell.len(), SWEEP_POINTS);
    assert!(cell[SWEEP_POINTS - 1].is_nan());
    assert!(cell[..SWEEP_POINTS - 1].iter().all(|v| !v.is_nan()));
    // The very next point is intact: the scan moved on to (2, 4).
    assert!(volume.rows[2][4].iter().all(|v| !v.is_nan()));

    let warned = drain(&mut events).into_iter().any(|e| {
        matches!(e, ScanEvent::TraceWarning { row: 2, column: 3, .. })
    });
    assert!(warned);
}

#[tokio::test(start_paused = true)]
async fn malformed_trace_marks_cell_missing() {
    let mut r = rig(settings(20.0), MockCamera::with_board_and_marker(), |tl| {
        MockSweep::new(tl).with_action(2, SweepAction::Malformed)
    });

    r.scanner.calibrate().await.unwrap();
    let mut sink = CapturingSink::default();
    let outcome = r.scanner.run(&mut sink).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Completed { .. }));

    let volume = sink.volume.unwrap();
    assert!(volume.rows[0][2].iter().all(|v| v.is_nan()));
    assert!(volume.rows[0][1].iter().all(|v| !v.is_nan()));
}

#[tokio::test(start_paused = true)]
async fn three_consecutive_drops_abort_the_scan() {
    let mut r = rig(settings(20.0), MockCamera::with_board_and_marker(), |tl| {
        MockSweep::new(tl)
            .with_action(3, SweepAction::Drop)
            .with_action(4, SweepAction::Drop)
            .with_action(5, SweepAction::Drop)
    });

    r.scanner.calibrate().await.unwrap();
    let mut events = r.scanner.take_events().unwrap();
    let mut sink = CapturingSink::default();
    let err = r.scanner.run(&mut sink).await.unwrap_err();
    assert!(matches!(err, ScanError::LinkDropped { .. }));
    assert_eq!(r.scanner.state(), ScanState::Idle);
    assert!(sink.volume.is_none());

    let aborted = drain(&mut events).into_iter().find_map(|e| match e {
        ScanEvent::Aborted {
            kind, last_point, ..
        } => Some((kind, last_point)),
        _ => None,
    });
    let (kind, last_point) = aborted.expect("no aborted event");
    assert_eq!(kind, "link_dropped");
    assert_eq!(last_point, Some((1, 0)));
}

#[tokio::test(start_paused = true)]
async fn single_drop_is_absorbed_and_resets_on_success() {
    let mut r = rig(settings(20.0), MockCamera::with_board_and_marker(), |tl| {
        MockSweep::new(tl)
            .with_action(2, SweepAction::Drop)
            .with_action(6, SweepAction::Drop)
            .with_action(10, SweepAction::Drop)
    });

    r.scanner.calibrate().await.unwrap();
    let mut sink = CapturingSink::default();
    // Drops are never consecutive, so the scan survives all three.
    let outcome = r.scanner.run(&mut sink).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Completed { .. }));
    let volume = sink.volume.unwrap();
    assert!(volume.rows[0][2].iter().all(|v| v.is_nan()));
}

#[tokio::test(start_paused = true)]
async fn stop_request_finishes_the_point_in_flight_first() {
    let mut r = rig(settings(20.0), MockCamera::with_board_and_marker(), MockSweep::new);

    r.scanner.calibrate().await.unwrap();
    r.sweep.stop_on_call(2, r.scanner.stop_handle());
    let mut events = r.scanner.take_events().unwrap();

    let mut sink = CapturingSink::default();
    let outcome = r.scanner.run(&mut sink).await.unwrap();
    // The stop arrived during the sweep of point (0, 2); that point still
    // completed and the machine halted at the next boundary.
    assert_eq!(
        outcome,
        ScanOutcome::Stopped {
            last_point: Some((0, 2))
        }
    );
    assert_eq!(r.scanner.state(), ScanState::Idle);
    assert!(sink.volume.is_none());

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        ScanEvent::PointRecorded { row: 0, column: 2, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, ScanEvent::Aborted { kind, .. } if kind == "stopped")));
}

#[tokio::test(start_paused = true)]
async fn robot_failure_aborts_immediately() {
    let timeline = Timeline::default();
    let sweep = MockSweep::new(timeline.clone());
    let camera = MockCamera::with_board_and_marker();
    let robot = Arc::new(MockRobot::failing_at(timeline, 4));
    let mut scanner = Scanner::new(
        calibration(),
        settings(20.0),
        robot,
        Arc::new(sweep),
        Arc::new(camera),
    );

    scanner.calibrate().await.unwrap();
    let mut sink = CapturingSink::default();
    let err = scanner.run(&mut sink).await.unwrap_err();
    assert!(matches!(err, ScanError::LinkDropped { device } if device == "robot"));
    assert_eq!(scanner.state(), ScanState::Idle);
}

#[tokio::test(start_paused = true)]
async fn serpentine_mirrors_odd_rows_on_the_robot() {
    let mut settings = settings(20.0);
    settings.traversal = Traversal::Serpentine;
    let r = rig(settings, MockCamera::with_board_and_marker(), MockSweep::new);
    let mut scanner = r.scanner;

    scanner.calibrate().await.unwrap();
    let mut sink = CapturingSink::default();
    let outcome = scanner.run(&mut sink).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Completed { .. }));

    // 5 columns per row at 20 mm pitch.
    let targets = r.robot.targets.lock().unwrap().clone();
    let row0: Vec<f64> = targets[0..5].iter().map(|p| p.x).collect();
    let row1: Vec<f64> = targets[5..10].iter().map(|p| p.x).collect();
    assert_eq!(row0, vec![0.0, 20.0, 40.0, 60.0, 80.0]);
    assert_eq!(row1, vec![80.0, 60.0, 40.0, 20.0, 0.0]);

    // The volume is still stored in column order.
    let volume = sink.volume.unwrap();
    assert!(volume.rows[1].iter().all(|c| c.len() == SWEEP_POINTS));
}

#[tokio::test(start_paused = true)]
async fn missing_marker_leaves_machine_ready_at_configured_height() {
    let mut settings = settings(20.0);
    settings.probe_height_mm = 10.0;
    let mut r = rig(settings, MockCamera::without_marker(), MockSweep::new);

    let err = r.scanner.calibrate().await.unwrap_err();
    assert!(matches!(err, ScanError::HeightMeasurement(_)));
    assert_eq!(r.scanner.state(), ScanState::Ready);
    assert_eq!(r.scanner.region().unwrap().height_mm, 10.0);

    // The scan still runs at the configured probe height.
    let mut sink = CapturingSink::default();
    let outcome = r.scanner.run(&mut sink).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Completed { .. }));
}

#[tokio::test(start_paused = true)]
async fn missing_board_detection_returns_to_idle() {
    let mut r = rig(settings(20.0), MockCamera::blind(), MockSweep::new);

    let err = r.scanner.calibrate().await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidCalibration(_)));
    assert_eq!(r.scanner.state(), ScanState::Idle);

    let mut sink = CapturingSink::default();
    let err = r.scanner.run(&mut sink).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn state_sequence_and_terminal_event_on_success() {
    let mut r = rig(settings(20.0), MockCamera::with_board_and_marker(), MockSweep::new);
    let mut events = r.scanner.take_events().unwrap();

    r.scanner.calibrate().await.unwrap();
    let mut sink = CapturingSink::default();
    r.scanner.run(&mut sink).await.unwrap();

    let states: Vec<ScanState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ScanEvent::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ScanState::Homing,
            ScanState::AwaitingOrigin,
            ScanState::MeasuringHeight,
            ScanState::Ready,
            ScanState::Scanning,
            ScanState::Saving,
            ScanState::Idle,
        ]
    );
}
