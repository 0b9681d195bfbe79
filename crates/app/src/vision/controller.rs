//! Detection state machine.
//!
//! The controller is the single owner of the background model, the active
//! tracker and the runtime parameters. Other threads influence it only
//! through [`ControlRequest`]s, which the worker drains before each frame so a
//! command never lands in the middle of a decision.
//!
//! Modes cycle CoolDown → Detecting → Tracking. The tracker lives inside the
//! `Tracking` variant, so a tracker exists exactly while tracking.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use chrono::Local;
use crossbeam_channel::{Receiver, Sender};
use motion_core::{
    BackgroundModel, BoundingBox, DEFAULT_DIFF_THRESHOLD, Mat, MotionError, Tracker,
    TrackerBackend, TrackerError, TrackerRegistry, find_regions,
    morphology::{close, edge_map},
    prepare::{prepare_subframe, to_gray_image},
};
use opencv::prelude::*;
use tracing::{debug, error, info, warn};
use video_ingest::{CameraControl, CaptureError, Frame, FrameSource};

use crate::vision::{
    control::{CommandError, ControlRequest},
    data::{
        Command, ControllerOutput, CrossingDetection, CrossingDirection, Diagnostics, Mode,
        RuntimeParameters, SharedStatus, StatusSnapshot, Timings,
    },
    decision::{
        DetectionGeometry, LineSide, committed_side, detect_crossing, leaves_frame,
        select_candidate,
    },
    processing::forward_output,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Sobel magnitude above which a pixel shows in the composite's edge panel.
const EDGE_THRESHOLD: u8 = 60;

/// Fixed tuning of the controller; only [`RuntimeParameters`] change at runtime.
#[derive(Clone, Debug)]
pub(crate) struct ControllerSettings {
    pub(crate) frame_width: u32,
    pub(crate) frame_height: u32,
    pub(crate) downscale: u32,
    pub(crate) blur_radius: u32,
    pub(crate) closing_radius: u32,
    pub(crate) diff_threshold: u8,
    /// Background learning rate while cooling down.
    pub(crate) learning_rate: f32,
    /// Learning rate applied on detecting frames without any foreground.
    pub(crate) nudge_rate: f32,
    /// Fraction of the frame treated as the exit border for tracked objects.
    pub(crate) edge_margin: f32,
    /// Attach composite diagnostics every this many frames.
    pub(crate) composite_every: u64,
    pub(crate) timings: Timings,
}

impl ControllerSettings {
    pub(crate) fn new(frame_width: u32, frame_height: u32, downscale: u32, timings: Timings) -> Self {
        Self {
            frame_width,
            frame_height,
            downscale: downscale.max(1),
            blur_radius: 2,
            closing_radius: 2,
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
            learning_rate: 0.1,
            nudge_rate: 0.005,
            edge_margin: 0.02,
            composite_every: 30,
            timings,
        }
    }
}

struct TrackState {
    tracker: Box<dyn Tracker>,
    bbox: BoundingBox,
    /// Side of `line_x` the object last fully committed to.
    side: Option<LineSide>,
    line_x: f32,
    since: Instant,
    dwell_deadline: Instant,
    last_success: Instant,
}

enum ControllerState {
    CoolDown { since: Instant },
    Detecting { since: Instant },
    Tracking(TrackState),
}

impl ControllerState {
    fn mode(&self) -> Mode {
        match self {
            ControllerState::CoolDown { .. } => Mode::CoolDown,
            ControllerState::Detecting { .. } => Mode::Detecting,
            ControllerState::Tracking(_) => Mode::Tracking,
        }
    }

    fn since(&self) -> Instant {
        match self {
            ControllerState::CoolDown { since } | ControllerState::Detecting { since } => *since,
            ControllerState::Tracking(track) => track.since,
        }
    }
}

enum Transition {
    CoolDown(&'static str),
    Detect(&'static str),
    Acquire(BoundingBox),
}

pub(crate) struct Controller {
    state: ControllerState,
    params: RuntimeParameters,
    registry: TrackerRegistry,
    backend: Arc<dyn TrackerBackend>,
    pending_backend: Option<Arc<dyn TrackerBackend>>,
    background: Option<BackgroundModel>,
    camera: Box<dyn CameraControl>,
    settings: ControllerSettings,
    previous_frame: Option<Arc<Frame>>,
    frame_number: u64,
}

impl Controller {
    /// Build a controller in CoolDown with the backend named in `params`.
    pub(crate) fn new(
        params: RuntimeParameters,
        registry: TrackerRegistry,
        camera: Box<dyn CameraControl>,
        settings: ControllerSettings,
        now: Instant,
    ) -> Result<Self, TrackerError> {
        let backend = registry.get(&params.tracker)?;
        let mut controller = Self {
            state: ControllerState::CoolDown { since: now },
            params,
            registry,
            backend,
            pending_backend: None,
            background: None,
            camera,
            settings,
            previous_frame: None,
            frame_number: 0,
        };
        controller.params.tracker = controller.backend.name().to_string();
        controller.enter_cooldown(now, "startup");
        Ok(controller)
    }

    pub(crate) fn mode(&self) -> Mode {
        self.state.mode()
    }

    pub(crate) fn has_tracker(&self) -> bool {
        matches!(self.state, ControllerState::Tracking(_))
    }

    /// Background model adapts on every frame only while cooling down.
    pub(crate) fn is_learning(&self) -> bool {
        matches!(self.state, ControllerState::CoolDown { .. })
    }

    pub(crate) fn params(&self) -> &RuntimeParameters {
        &self.params
    }

    pub(crate) fn background(&self) -> Option<&BackgroundModel> {
        self.background.as_ref()
    }

    pub(crate) fn active_backend(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) fn status(&self, fps: f32, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            mode: self.mode(),
            mode_elapsed_secs: now.saturating_duration_since(self.state.since()).as_secs_f32(),
            fps,
            frame_number: self.frame_number,
            params: self.params.clone(),
            active_tracker: self.backend.name(),
            pending_tracker: self.pending_backend.as_ref().map(|backend| backend.name()),
        }
    }

    /// Apply one operator command. Rejected commands leave every parameter
    /// and the mode untouched.
    pub(crate) fn apply(&mut self, command: Command, now: Instant) -> Result<String, CommandError> {
        match command {
            Command::TriggerCooldown => {
                self.enter_cooldown(now, "operator request");
                Ok("cool-down started".into())
            }
            Command::Recalibrate => {
                self.background = None;
                self.enter_cooldown(now, "recalibration");
                Ok("background model reset, cool-down started".into())
            }
            Command::SetTrackerBackend(name) => {
                let backend = self.registry.get(&name).map_err(|_| CommandError::UnknownTracker {
                    name: name.clone(),
                    available: self.registry.names().join(", "),
                })?;
                let resolved = backend.name();
                self.params.tracker = resolved.to_string();
                if self.has_tracker() {
                    self.pending_backend = Some(backend);
                    Ok(format!("tracker {resolved} applies from the next detection"))
                } else {
                    self.backend = backend;
                    self.pending_backend = None;
                    Ok(format!("tracker set to {resolved}"))
                }
            }
            Command::SetLineX(x) => {
                if x >= self.settings.frame_width {
                    return Err(CommandError::InvalidValue {
                        param: "line_x",
                        reason: format!(
                            "{x} lies outside the {}px wide frame",
                            self.settings.frame_width
                        ),
                    });
                }
                if x == self.params.line_x {
                    return Ok(format!("line_x already {x}"));
                }
                self.params.line_x = x;
                Ok(format!("line_x set to {x}"))
            }
            Command::SetMinY(pct) => {
                check_percent("min_y", pct)?;
                if pct >= self.params.max_y_pct {
                    return Err(CommandError::InvalidValue {
                        param: "min_y",
                        reason: format!("{pct} must be below max_y {}", self.params.max_y_pct),
                    });
                }
                self.params.min_y_pct = pct;
                Ok(format!("min_y set to {pct}%"))
            }
            Command::SetMaxY(pct) => {
                check_percent("max_y", pct)?;
                if pct <= self.params.min_y_pct {
                    return Err(CommandError::InvalidValue {
                        param: "max_y",
                        reason: format!("{pct} must be above min_y {}", self.params.min_y_pct),
                    });
                }
                self.params.max_y_pct = pct;
                Ok(format!("max_y set to {pct}%"))
            }
            Command::ResetAutofocus => self
                .camera
                .reset_autofocus()
                .map(|()| "autofocus reset".to_string())
                .map_err(|err| CommandError::Camera(err.to_string())),
        }
    }

    /// Run one frame through the state machine.
    pub(crate) fn step(
        &mut self,
        frame: Arc<Frame>,
        fps: f32,
        now: Instant,
    ) -> Result<ControllerOutput, MotionError> {
        let sub = self.prepare(&frame)?;
        self.frame_number = self.frame_number.wrapping_add(1);

        let model = match self.background.take() {
            Some(model) if model.matches(&sub) => model,
            _ => {
                debug!("Seeding background model from frame #{}", self.frame_number);
                BackgroundModel::new(&sub, self.settings.diff_threshold)?
            }
        };
        let background = self.background.insert(model);
        let (sub_width, sub_height) = (sub.cols() as u32, sub.rows() as u32);
        let geometry =
            DetectionGeometry::new(&self.params, sub_width, sub_height, self.settings.downscale);

        let settings = &self.settings;
        let mut mask = None;
        let mut direction = None;
        let transition = match &mut self.state {
            ControllerState::CoolDown { since } => {
                background.learn(&sub, settings.learning_rate)?;
                (now.saturating_duration_since(*since) >= settings.timings.cooldown)
                    .then_some(Transition::Detect("cool-down elapsed"))
            }
            ControllerState::Detecting { .. } => {
                let closed = close(&background.foreground(&sub)?, settings.closing_radius)?;
                let regions = find_regions(&closed)?;
                mask = Some(closed);
                if regions.is_empty() {
                    background.learn(&sub, settings.nudge_rate)?;
                    None
                } else {
                    select_candidate(&regions, &geometry).map(Transition::Acquire)
                }
            }
            ControllerState::Tracking(track) => {
                let (transition, crossed) = follow(track, &sub, &geometry, settings, now);
                direction = crossed;
                transition
            }
        };

        match transition {
            Some(Transition::CoolDown(reason)) => self.enter_cooldown(now, reason),
            Some(Transition::Detect(reason)) => self.enter_detecting(now, reason),
            Some(Transition::Acquire(bbox)) => {
                self.start_tracking(&sub, bbox, geometry.line_x, now)
            }
            None => {}
        }

        let crossing = direction.map(|direction| self.confirm_crossing(direction, &frame));
        let wants_diagnostics = crossing.is_some()
            || self.frame_number % self.settings.composite_every.max(1) == 0;
        let diagnostics = match (wants_diagnostics, self.background.as_ref()) {
            (true, Some(model)) => {
                let radius = self.settings.closing_radius;
                match build_diagnostics(model, &sub, mask, radius, geometry.line_x) {
                    Ok(diagnostics) => Some(diagnostics),
                    Err(err) => {
                        warn!("No diagnostics for frame #{}: {err}", self.frame_number);
                        None
                    }
                }
            }
            _ => None,
        };

        let mode = self.mode();
        metrics::gauge!("linecam_mode").set(mode.gauge_value());
        let bbox = match &self.state {
            ControllerState::Tracking(track) => Some(track.bbox.scaled(self.settings.downscale)),
            _ => None,
        };
        self.previous_frame = Some(frame.clone());

        Ok(ControllerOutput {
            frame,
            frame_number: self.frame_number,
            fps,
            mode,
            mode_elapsed: now.saturating_duration_since(self.state.since()),
            bbox,
            params: self.params.clone(),
            tracker: self.backend.name(),
            crossing,
            diagnostics,
        })
    }

    fn prepare(&self, frame: &Frame) -> Result<Mat, MotionError> {
        let width = u32::try_from(frame.width).unwrap_or(0);
        let height = u32::try_from(frame.height).unwrap_or(0);
        prepare_subframe(
            &frame.data,
            width,
            height,
            self.settings.downscale,
            self.settings.blur_radius,
        )
    }

    fn confirm_crossing(&self, direction: CrossingDirection, frame: &Arc<Frame>) -> CrossingDetection {
        info!(
            direction = direction.label(),
            frame = self.frame_number,
            line_x = self.params.line_x,
            "Line crossing detected"
        );
        metrics::counter!("linecam_crossings_total", "direction" => direction.label()).increment(1);
        CrossingDetection {
            direction,
            timestamp: Local::now(),
            previous: self.previous_frame.clone().unwrap_or_else(|| frame.clone()),
        }
    }

    fn enter_cooldown(&mut self, now: Instant, reason: &'static str) {
        info!(mode = "cooldown", reason, "Entering cool-down");
        self.state = ControllerState::CoolDown { since: now };
        if let Err(err) = self.camera.set_auto_exposure(true) {
            warn!("Failed to enable auto exposure: {err}");
        }
    }

    fn enter_detecting(&mut self, now: Instant, reason: &'static str) {
        let from_cooldown = self.is_learning();
        info!(mode = "detecting", reason, "Entering detection");
        self.state = ControllerState::Detecting { since: now };
        if from_cooldown {
            if let Err(err) = self.camera.set_auto_exposure(false) {
                warn!("Failed to disable auto exposure: {err}");
            }
        }
    }

    fn start_tracking(&mut self, sub: &Mat, bbox: BoundingBox, line_x: f32, now: Instant) {
        if let Some(backend) = self.pending_backend.take() {
            info!("Switching tracker backend to {}", backend.name());
            self.backend = backend;
        }
        match self.backend.init(sub, bbox) {
            Ok(tracker) => {
                info!(
                    mode = "tracking",
                    backend = self.backend.name(),
                    x = bbox.x,
                    y = bbox.y,
                    width = bbox.width,
                    height = bbox.height,
                    "Tracking candidate"
                );
                self.state = ControllerState::Tracking(TrackState {
                    tracker,
                    bbox,
                    side: committed_side(&bbox, line_x),
                    line_x,
                    since: now,
                    dwell_deadline: now + self.settings.timings.dwell,
                    last_success: now,
                });
            }
            Err(err) => {
                warn!("Tracker {} failed to initialise: {err}", self.backend.name());
                metrics::counter!("linecam_tracker_init_failures_total").increment(1);
            }
        }
    }
}

/// Sub-frame panels for the diagnostic composite.
fn build_diagnostics(
    background: &BackgroundModel,
    sub: &Mat,
    mask: Option<Mat>,
    closing_radius: u32,
    line_x: f32,
) -> Result<Diagnostics, MotionError> {
    let mask = match mask {
        Some(mask) => mask,
        None => close(&background.foreground(sub)?, closing_radius)?,
    };
    Ok(Diagnostics {
        background: to_gray_image(&background.background_image()?)?,
        subframe: to_gray_image(sub)?,
        mask: to_gray_image(&mask)?,
        edges: to_gray_image(&edge_map(sub, EDGE_THRESHOLD)?)?,
        line_x: line_x.round() as u32,
    })
}

/// One tracking update: exit checks, crossing test and dwell bookkeeping.
fn follow(
    track: &mut TrackState,
    sub: &Mat,
    geometry: &DetectionGeometry,
    settings: &ControllerSettings,
    now: Instant,
) -> (Option<Transition>, Option<CrossingDirection>) {
    let Some(bbox) = track.tracker.update(sub) else {
        let lost_for = now.saturating_duration_since(track.last_success);
        if lost_for > settings.timings.resilience {
            return (Some(Transition::Detect("tracker lost")), None);
        }
        return (None, None);
    };
    track.last_success = now;

    if leaves_frame(&bbox, geometry.width, geometry.height, settings.edge_margin) {
        return (Some(Transition::CoolDown("object left the frame")), None);
    }

    if track.line_x != geometry.line_x {
        // The operator moved the line: re-anchor without reporting a crossing.
        track.side = committed_side(&track.bbox, geometry.line_x);
        track.line_x = geometry.line_x;
    }
    let (side, crossed) = detect_crossing(track.side, &bbox, geometry.line_x);
    track.side = side;
    if crossed.is_some() {
        track.dwell_deadline = now + settings.timings.dwell;
    }
    track.bbox = bbox;

    if now >= track.dwell_deadline {
        return (Some(Transition::CoolDown("dwell timeout")), crossed);
    }
    (None, crossed)
}

fn check_percent(param: &'static str, pct: u32) -> Result<(), CommandError> {
    if pct > 100 {
        return Err(CommandError::InvalidValue {
            param,
            reason: format!("{pct} is not a percentage"),
        });
    }
    Ok(())
}

/// Apply every queued command, answering each caller.
///
/// Requests whose caller stopped waiting are discarded unapplied; the
/// return value counts only applied commands.
pub(crate) fn drain_commands(
    commands: &Receiver<ControlRequest>,
    controller: &mut Controller,
    now: Instant,
) -> usize {
    let mut applied = 0;
    while let Ok(request) = commands.try_recv() {
        let label = request.command.label();
        if request.reply.is_closed() {
            warn!(command = label, "Discarding expired command");
            metrics::counter!("linecam_expired_commands_total").increment(1);
            continue;
        }
        let outcome = controller.apply(request.command, now);
        match &outcome {
            Ok(message) => info!(command = label, "{message}"),
            Err(err) => warn!(command = label, "Command rejected: {err}"),
        }
        let _ = request.reply.send(outcome);
        applied += 1;
    }
    applied
}

pub(crate) struct ControllerLinks {
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) commands: Receiver<ControlRequest>,
    pub(crate) output_tx: Sender<ControllerOutput>,
    pub(crate) status: SharedStatus,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) running: Arc<AtomicBool>,
}

/// Spawn the capture + state machine worker.
///
/// Returns the capture error that stopped it, if any; a stalled or closed
/// source is fatal to the pipeline.
pub(crate) fn spawn_controller_worker(
    mut controller: Controller,
    links: ControllerLinks,
) -> thread::JoinHandle<Result<(), CaptureError>> {
    telemetry::spawn_thread("linecam-controller", move || {
        let ControllerLinks {
            mut source,
            commands,
            output_tx,
            status,
            health,
            running,
        } = links;
        let worker_span = tracing::info_span!("controller.worker");
        let _worker_guard = worker_span.enter();

        let mut smoothed_fps: f32 = 0.0;
        let mut last_instant = Instant::now();

        while running.load(Ordering::Relaxed) {
            drain_commands(&commands, &mut controller, Instant::now());

            let frame = match tracing::info_span!("capture.recv").in_scope(|| source.capture()) {
                Ok(frame) => frame,
                Err(err) => {
                    error!("Capture error: {err}");
                    running.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            };
            health.beat(HealthComponent::Capture);
            let stage_start = Instant::now();

            let elapsed = stage_start.duration_since(last_instant).as_secs_f32();
            last_instant = stage_start;
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                smoothed_fps = if smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * smoothed_fps + 0.1 * instant
                };
            }
            metrics::gauge!("linecam_pipeline_fps").set(smoothed_fps as f64);

            match controller.step(Arc::new(frame), smoothed_fps, stage_start) {
                Ok(output) => {
                    if let Ok(mut guard) = status.lock() {
                        *guard = Some(controller.status(smoothed_fps, stage_start));
                    }
                    if output.frame_number % 30 == 0 {
                        debug!(
                            "Controller heartbeat: frame #{}, {:.1} fps, mode {}",
                            output.frame_number,
                            smoothed_fps,
                            output.mode.label()
                        );
                    }
                    if forward_output(&output_tx, output).is_err() {
                        error!("Post-processing stage terminated unexpectedly");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                Err(err) => {
                    warn!("Skipping malformed frame: {err}");
                    metrics::counter!("linecam_malformed_frames_total").increment(1);
                }
            }

            metrics::histogram!("linecam_stage_latency_seconds", "stage" => "controller")
                .record(stage_start.elapsed().as_secs_f64());
        }
        Ok(())
    })
    .expect("failed to spawn controller worker")
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };

    use video_ingest::FrameFormat;

    use super::*;

    const WIDTH: u32 = 1000;
    const HEIGHT: u32 = 60;

    #[derive(Clone, Default)]
    struct FakeCamera {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeCamera {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CameraControl for FakeCamera {
        fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), CaptureError> {
            self.calls.lock().unwrap().push(format!("auto_exposure={enabled}"));
            Ok(())
        }

        fn reset_autofocus(&mut self) -> Result<(), CaptureError> {
            self.calls.lock().unwrap().push("autofocus".into());
            Ok(())
        }
    }

    /// Backend whose trackers replay a shared script of update results.
    struct ScriptedBackend {
        name: &'static str,
        script: Arc<Mutex<VecDeque<Option<BoundingBox>>>>,
        fail_init: bool,
    }

    struct ScriptedTracker {
        script: Arc<Mutex<VecDeque<Option<BoundingBox>>>>,
    }

    impl Tracker for ScriptedTracker {
        fn update(&mut self, _frame: &Mat) -> Option<BoundingBox> {
            self.script.lock().unwrap().pop_front().flatten()
        }
    }

    impl TrackerBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn init(
            &self,
            _frame: &Mat,
            bbox: BoundingBox,
        ) -> Result<Box<dyn Tracker>, TrackerError> {
            if self.fail_init {
                return Err(TrackerError::TooSmall {
                    width: bbox.width,
                    height: bbox.height,
                    min: u32::MAX,
                });
            }
            Ok(Box::new(ScriptedTracker {
                script: self.script.clone(),
            }))
        }
    }

    struct Fixture {
        controller: Controller,
        camera: FakeCamera,
        script: Arc<Mutex<VecDeque<Option<BoundingBox>>>>,
        t0: Instant,
    }

    impl Fixture {
        fn new(fail_init: bool) -> Self {
            let script = Arc::new(Mutex::new(VecDeque::new()));
            let mut registry = TrackerRegistry::with_defaults();
            for name in ["SCRIPTED", "SCRIPTED_ALT"] {
                registry.register(Arc::new(ScriptedBackend {
                    name,
                    script: script.clone(),
                    fail_init,
                }));
            }
            let params = RuntimeParameters {
                line_x: 800,
                min_y_pct: 0,
                max_y_pct: 100,
                band: 0.05,
                min_area: 0.001,
                tracker: "scripted".into(),
            };
            let mut settings = ControllerSettings::new(
                WIDTH,
                HEIGHT,
                1,
                Timings {
                    cooldown: Duration::from_secs(1),
                    dwell: Duration::from_secs(10),
                    resilience: Duration::from_millis(500),
                },
            );
            settings.blur_radius = 0;
            settings.closing_radius = 1;
            settings.composite_every = 1_000;
            let camera = FakeCamera::default();
            let t0 = Instant::now();
            let controller =
                Controller::new(params, registry, Box::new(camera.clone()), settings, t0)
                    .expect("controller");
            Self {
                controller,
                camera,
                script,
                t0,
            }
        }

        fn at(&self, millis: u64) -> Instant {
            self.t0 + Duration::from_millis(millis)
        }

        fn step(&mut self, object: Option<(u32, u32, u32, u32)>, millis: u64) -> ControllerOutput {
            let now = self.at(millis);
            let output = self
                .controller
                .step(frame(object), 25.0, now)
                .expect("valid frame");
            assert_eq!(
                self.controller.has_tracker(),
                self.controller.mode() == Mode::Tracking
            );
            output
        }

        fn script(&self, boxes: &[Option<(u32, u32, u32, u32)>]) {
            let mut script = self.script.lock().unwrap();
            for entry in boxes {
                script.push_back(entry.and_then(|(x, y, w, h)| BoundingBox::new(x, y, w, h)));
            }
        }

        /// Cool down on an empty scene, then detect a 10px object at x=790.
        fn tracking(fail_init: bool) -> Self {
            Self::tracking_object(fail_init, (790, 20, 10, 20))
        }

        fn tracking_object(fail_init: bool, object: (u32, u32, u32, u32)) -> Self {
            let mut fixture = Self::new(fail_init);
            fixture.step(None, 0);
            assert_eq!(fixture.step(None, 1_100).mode, Mode::Detecting);
            fixture.step(Some(object), 1_200);
            fixture
        }

        /// Run the scripted boxes one frame each, 40 ms apart, and collect
        /// the crossings they produce.
        fn crossings(
            &mut self,
            boxes: &[(u32, u32, u32, u32)],
        ) -> Vec<(usize, CrossingDirection)> {
            self.script(&boxes.iter().copied().map(Some).collect::<Vec<_>>());
            let mut fired = Vec::new();
            for i in 0..boxes.len() {
                let output = self.step(None, 1_240 + 40 * i as u64);
                if let Some(crossing) = output.crossing {
                    fired.push((i, crossing.direction));
                }
            }
            fired
        }
    }

    fn frame(object: Option<(u32, u32, u32, u32)>) -> Arc<Frame> {
        let mut data = vec![40u8; (WIDTH * HEIGHT * 3) as usize];
        if let Some((x, y, w, h)) = object {
            for row in y..y + h {
                for col in x..x + w {
                    let idx = ((row * WIDTH + col) * 3) as usize;
                    data[idx..idx + 3].copy_from_slice(&[200, 200, 200]);
                }
            }
        }
        Arc::new(Frame {
            data,
            width: WIDTH as i32,
            height: HEIGHT as i32,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        })
    }

    #[test]
    fn cooldown_toggles_auto_exposure_and_leads_to_detection() {
        let mut fixture = Fixture::new(false);
        assert_eq!(fixture.controller.mode(), Mode::CoolDown);
        assert_eq!(fixture.step(None, 500).mode, Mode::CoolDown);
        assert_eq!(fixture.step(None, 1_000).mode, Mode::Detecting);
        assert_eq!(
            fixture.camera.calls(),
            vec!["auto_exposure=true", "auto_exposure=false"]
        );
    }

    #[test]
    fn candidate_starts_tracking() {
        let fixture = Fixture::tracking(false);
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
        assert!(fixture.controller.has_tracker());
        assert_eq!(fixture.controller.active_backend(), "SCRIPTED");
    }

    #[test]
    fn failed_tracker_init_stays_detecting() {
        let fixture = Fixture::tracking(true);
        assert_eq!(fixture.controller.mode(), Mode::Detecting);
        assert!(!fixture.controller.has_tracker());
    }

    #[test]
    fn one_right_crossing_per_traversal() {
        let mut fixture = Fixture::tracking(false);
        fixture.script(&[
            Some((805, 20, 10, 20)),
            Some((812, 21, 10, 20)),
            Some((820, 21, 10, 20)),
        ]);

        let crossing_frame = fixture.step(Some((805, 20, 10, 20)), 1_240);
        let crossing = crossing_frame.crossing.as_ref().expect("crossing on frame N+1");
        assert_eq!(crossing.direction, CrossingDirection::Right);
        assert!(crossing_frame.diagnostics.is_some());
        assert_eq!(crossing_frame.bbox, BoundingBox::new(805, 20, 10, 20));

        let later: Vec<_> = [1_280, 1_320]
            .into_iter()
            .map(|ms| fixture.step(None, ms))
            .collect();
        assert!(later.iter().all(|output| output.crossing.is_none()));
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
    }

    #[test]
    fn five_pixel_object_crossing_right_fires_on_the_next_frame() {
        let mut fixture = Fixture::tracking_object(false, (790, 20, 5, 20));
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
        // Trailing edge at 790 on frame N, leading edge at 805 on frame N+1.
        let fired = fixture.crossings(&[(800, 20, 5, 20), (806, 20, 5, 20), (813, 20, 5, 20)]);
        assert_eq!(fired, vec![(0, CrossingDirection::Right)]);
    }

    #[test]
    fn jitter_across_the_line_fires_once() {
        let mut fixture = Fixture::tracking(false);
        let fired = fixture.crossings(&[
            (801, 20, 10, 20),
            (799, 20, 10, 20),
            (801, 20, 10, 20),
            (799, 20, 10, 20),
            (801, 20, 10, 20),
        ]);
        assert_eq!(fired, vec![(0, CrossingDirection::Right)]);
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
    }

    #[test]
    fn drifting_back_into_the_band_does_not_refire() {
        let mut fixture = Fixture::tracking(false);
        let fired = fixture.crossings(&[
            (802, 20, 10, 20),
            (796, 21, 10, 20),
            (792, 21, 10, 20),
            (804, 21, 10, 20),
        ]);
        assert_eq!(fired, vec![(0, CrossingDirection::Right)]);
    }

    #[test]
    fn moving_the_line_under_a_tracked_object_is_silent() {
        let mut fixture = Fixture::tracking(false);
        let now = fixture.at(1_220);
        fixture.controller.apply(Command::SetLineX(700), now).unwrap();
        // The old box now sits right of the line; only a full move left of
        // the new line counts.
        let fired = fixture.crossings(&[
            (792, 20, 10, 20),
            (695, 20, 10, 20),
            (688, 20, 10, 20),
        ]);
        assert_eq!(fired, vec![(2, CrossingDirection::Left)]);
    }

    #[test]
    fn lost_tracker_returns_to_detecting_after_resilience() {
        let mut fixture = Fixture::tracking(false);
        fixture.script(&[None, None, None]);

        let output = fixture.step(None, 1_500);
        assert_eq!(output.mode, Mode::Tracking);
        let output = fixture.step(None, 1_750);
        assert_eq!(output.mode, Mode::Detecting);
        assert!(output.crossing.is_none());
        assert!(!fixture.controller.has_tracker());
        assert!(fixture.camera.calls().iter().all(|call| call != "autofocus"));
    }

    #[test]
    fn dwell_timeout_forces_cooldown() {
        let mut fixture = Fixture::tracking(false);
        fixture.script(&[Some((792, 20, 10, 20)), Some((793, 20, 10, 20))]);
        assert_eq!(fixture.step(None, 5_000).mode, Mode::Tracking);
        assert_eq!(fixture.step(None, 11_300).mode, Mode::CoolDown);
    }

    #[test]
    fn object_reaching_the_border_forces_cooldown() {
        let mut fixture = Fixture::tracking(false);
        fixture.script(&[Some((990, 20, 10, 20))]);
        let output = fixture.step(None, 1_240);
        assert_eq!(output.mode, Mode::CoolDown);
        assert!(output.crossing.is_none());
    }

    #[test]
    fn cooldown_command_mid_tracking_clears_tracker() {
        let mut fixture = Fixture::tracking(false);
        let now = fixture.at(1_220);
        fixture
            .controller
            .apply(Command::TriggerCooldown, now)
            .expect("accepted");
        assert_eq!(fixture.controller.mode(), Mode::CoolDown);
        assert!(!fixture.controller.has_tracker());
        assert!(fixture.controller.is_learning());

        let pixel = |fixture: &Fixture| {
            let model = fixture.controller.background().unwrap();
            *model.background_image().unwrap().at_2d::<u8>(30, 105).unwrap()
        };
        let before = pixel(&fixture);
        let output = fixture.step(Some((100, 20, 10, 20)), 1_240);
        assert_eq!(output.mode, Mode::CoolDown);
        assert!(pixel(&fixture) > before);
        assert_eq!(fixture.camera.calls().last().unwrap(), "auto_exposure=true");
    }

    #[test]
    fn recalibrate_drops_background() {
        let mut fixture = Fixture::tracking(false);
        let now = fixture.at(1_220);
        fixture.controller.apply(Command::Recalibrate, now).unwrap();
        assert!(fixture.controller.background().is_none());
        assert_eq!(fixture.controller.mode(), Mode::CoolDown);
        fixture.step(None, 1_240);
        assert!(fixture.controller.background().is_some());
    }

    #[test]
    fn repeated_line_x_is_a_no_op() {
        let mut fixture = Fixture::tracking(false);
        let now = fixture.at(1_220);
        let before = fixture.controller.params().clone();
        for _ in 0..3 {
            fixture.controller.apply(Command::SetLineX(800), now).unwrap();
        }
        assert_eq!(fixture.controller.params(), &before);
        assert_eq!(fixture.controller.mode(), Mode::Tracking);

        assert!(fixture.controller.apply(Command::SetLineX(WIDTH), now).is_err());
        fixture.controller.apply(Command::SetLineX(600), now).unwrap();
        assert_eq!(fixture.controller.params().line_x, 600);
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
    }

    #[test]
    fn inverted_vertical_band_is_rejected() {
        let mut fixture = Fixture::new(false);
        let now = fixture.at(10);
        fixture.controller.apply(Command::SetMaxY(60), now).unwrap();
        let err = fixture
            .controller
            .apply(Command::SetMinY(60), now)
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(fixture.controller.params().min_y_pct, 0);
        assert_eq!(fixture.controller.params().max_y_pct, 60);

        assert!(fixture.controller.apply(Command::SetMaxY(0), now).is_err());
        assert!(fixture.controller.apply(Command::SetMinY(101), now).is_err());
        fixture.controller.apply(Command::SetMinY(59), now).unwrap();
        assert_eq!(fixture.controller.params().min_y_pct, 59);
    }

    #[test]
    fn backend_switch_waits_for_the_next_detection() {
        let mut fixture = Fixture::tracking(false);
        let now = fixture.at(1_220);
        fixture
            .controller
            .apply(Command::SetTrackerBackend("scripted_alt".into()), now)
            .unwrap();
        let status = fixture.controller.status(0.0, now);
        assert_eq!(status.active_tracker, "SCRIPTED");
        assert_eq!(status.pending_tracker, Some("SCRIPTED_ALT"));
        assert_eq!(status.params.tracker, "SCRIPTED_ALT");

        fixture.script(&[None]);
        assert_eq!(fixture.step(None, 1_800).mode, Mode::Detecting);
        fixture.step(Some((790, 20, 10, 20)), 1_840);
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
        assert_eq!(fixture.controller.active_backend(), "SCRIPTED_ALT");

        let err = fixture
            .controller
            .apply(Command::SetTrackerBackend("SAD".into()), now)
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownTracker { .. }));
    }

    #[test]
    fn autofocus_is_forwarded_to_the_camera() {
        let mut fixture = Fixture::new(false);
        let now = fixture.at(0);
        fixture.controller.apply(Command::ResetAutofocus, now).unwrap();
        assert_eq!(fixture.camera.calls().last().unwrap(), "autofocus");
    }

    #[test]
    fn queued_commands_are_answered() {
        let mut fixture = Fixture::new(false);
        let (tx, rx) = crossbeam_channel::unbounded();
        let (reply, mut answer) = tokio::sync::oneshot::channel();
        tx.send(ControlRequest {
            command: Command::SetMinY(100),
            reply,
        })
        .unwrap();
        let now = fixture.at(0);
        assert_eq!(drain_commands(&rx, &mut fixture.controller, now), 1);
        assert!(answer.try_recv().unwrap().is_err());
    }

    #[test]
    fn commands_whose_caller_gave_up_are_not_applied() {
        let mut fixture = Fixture::tracking(false);
        let (tx, rx) = crossbeam_channel::unbounded();
        let before = fixture.controller.params().clone();
        for command in [Command::SetLineX(600), Command::TriggerCooldown] {
            let (reply, answer) = tokio::sync::oneshot::channel();
            drop(answer);
            tx.send(ControlRequest { command, reply }).unwrap();
        }
        let (reply, mut answer) = tokio::sync::oneshot::channel();
        tx.send(ControlRequest {
            command: Command::SetMaxY(90),
            reply,
        })
        .unwrap();

        let now = fixture.at(1_220);
        assert_eq!(drain_commands(&rx, &mut fixture.controller, now), 1);
        assert_eq!(fixture.controller.params().line_x, before.line_x);
        assert_eq!(fixture.controller.params().max_y_pct, 90);
        assert_eq!(fixture.controller.mode(), Mode::Tracking);
        assert!(answer.try_recv().unwrap().is_ok());
    }
}
