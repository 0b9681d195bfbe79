//! Frame acquisition for the line-crossing detector.
//!
//! Capture runs on FFmpeg child processes; this crate only deals in raw BGR
//! frames, the blocking [`FrameSource`] capability and the [`CameraControl`]
//! calls the detector issues on mode transitions.

pub mod control;
pub mod ffmpeg;
pub mod source;
pub mod types;

pub use control::{CameraControl, NoopControl, V4l2Control};
pub use source::{ChannelSource, FrameSource, SourceKind, open_source};
pub use types::{CaptureError, Frame, FrameFormat};
