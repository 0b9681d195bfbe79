use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Local};
use image::{GrayImage, RgbImage};
use motion_core::BoundingBox;
use serde::Serialize;
use video_ingest::Frame;

/// Wire format of the crossing timestamp sent to the collector.
pub(crate) const CROSSING_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Mode {
    CoolDown,
    Detecting,
    Tracking,
}

impl Mode {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Mode::CoolDown => "COOLDOWN",
            Mode::Detecting => "DETECTING",
            Mode::Tracking => "TRACKING",
        }
    }

    /// Value exported on the `linecam_mode` gauge.
    pub(crate) fn gauge_value(self) -> f64 {
        match self {
            Mode::CoolDown => 0.0,
            Mode::Detecting => 1.0,
            Mode::Tracking => 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum CrossingDirection {
    Left,
    Right,
}

impl CrossingDirection {
    pub(crate) fn label(self) -> &'static str {
        match self {
            CrossingDirection::Left => "LEFT",
            CrossingDirection::Right => "RIGHT",
        }
    }
}

/// Runtime adjustments accepted by the controller.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    TriggerCooldown,
    Recalibrate,
    SetTrackerBackend(String),
    SetLineX(u32),
    SetMinY(u32),
    SetMaxY(u32),
    ResetAutofocus,
}

impl Command {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Command::TriggerCooldown => "cooldown",
            Command::Recalibrate => "recalibrate",
            Command::SetTrackerBackend(_) => "tracker",
            Command::SetLineX(_) => "line_x",
            Command::SetMinY(_) => "min_y",
            Command::SetMaxY(_) => "max_y",
            Command::ResetAutofocus => "autofocus",
        }
    }
}

/// Detection geometry and tracker selection, mutated only by commands.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct RuntimeParameters {
    /// Detection line, full-resolution pixels.
    pub(crate) line_x: u32,
    /// Vertical acceptance band, percent of frame height.
    pub(crate) min_y_pct: u32,
    pub(crate) max_y_pct: u32,
    /// Half width of the horizontal acceptance band, fraction of frame width.
    pub(crate) band: f32,
    /// Minimum candidate area, fraction of the sub-frame area.
    pub(crate) min_area: f32,
    /// Requested tracker backend.
    pub(crate) tracker: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Timings {
    pub(crate) cooldown: Duration,
    pub(crate) dwell: Duration,
    pub(crate) resilience: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3),
            dwell: Duration::from_secs(10),
            resilience: Duration::from_millis(500),
        }
    }
}

/// Sub-frame images used to build the diagnostic composite.
#[derive(Clone)]
pub(crate) struct Diagnostics {
    pub(crate) background: GrayImage,
    pub(crate) subframe: GrayImage,
    pub(crate) mask: GrayImage,
    /// Thresholded Sobel magnitude of the sub-frame.
    pub(crate) edges: GrayImage,
    /// Detection line in sub-frame pixels.
    pub(crate) line_x: u32,
}

/// A crossing confirmed by the controller on this frame.
#[derive(Clone)]
pub(crate) struct CrossingDetection {
    pub(crate) direction: CrossingDirection,
    pub(crate) timestamp: DateTime<Local>,
    pub(crate) previous: Arc<Frame>,
}

/// Everything post-processing needs about one controller iteration.
pub(crate) struct ControllerOutput {
    pub(crate) frame: Arc<Frame>,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) mode: Mode,
    pub(crate) mode_elapsed: Duration,
    /// Tracked box scaled back to full resolution.
    pub(crate) bbox: Option<BoundingBox>,
    pub(crate) params: RuntimeParameters,
    pub(crate) tracker: &'static str,
    pub(crate) crossing: Option<CrossingDetection>,
    pub(crate) diagnostics: Option<Diagnostics>,
}

/// Confirmed crossing on its way to the collector.
pub(crate) struct CrossingEvent {
    pub(crate) timestamp: DateTime<Local>,
    pub(crate) direction: CrossingDirection,
    pub(crate) previous: Arc<Frame>,
    pub(crate) current: Arc<Frame>,
    pub(crate) composite: RgbImage,
}

/// Transport-ready crossing payload.
#[derive(Clone, Debug)]
pub(crate) struct EncodedCrossing {
    pub(crate) time: String,
    pub(crate) direction: CrossingDirection,
    pub(crate) previous_jpeg: Vec<u8>,
    pub(crate) current_jpeg: Vec<u8>,
    pub(crate) stack_jpeg: Vec<u8>,
}

#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
}

/// Item on the lossy preview queue.
#[derive(Clone)]
pub(crate) enum StreamPacket {
    Live(FramePacket),
    Composite(FramePacket),
}

impl StreamPacket {
    pub(crate) fn frame_number(&self) -> u64 {
        match self {
            StreamPacket::Live(packet) | StreamPacket::Composite(packet) => packet.frame_number,
        }
    }
}

/// Controller state published for `/status`.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) mode: Mode,
    pub(crate) mode_elapsed_secs: f32,
    pub(crate) fps: f32,
    pub(crate) frame_number: u64,
    pub(crate) params: RuntimeParameters,
    pub(crate) active_tracker: &'static str,
    pub(crate) pending_tracker: Option<&'static str>,
}

pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;
pub(crate) type SharedStatus = Arc<Mutex<Option<StatusSnapshot>>>;
