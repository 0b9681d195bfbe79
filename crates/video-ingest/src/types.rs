use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
///
/// Frames are immutable once captured; stages that need to keep one past the
/// current iteration share it behind an `Arc` instead of copying the buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Bytes per pixel for the frame's pixel format.
    pub fn channels(&self) -> usize {
        match self.format {
            FrameFormat::Bgr8 => 3,
        }
    }

    /// Returns true when the buffer length matches the declared dimensions.
    pub fn is_consistent(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == (self.width as usize) * (self.height as usize) * self.channels()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("no frame received within {0:?}")]
    Stalled(Duration),
    #[error("video source closed")]
    Closed,
    #[error("camera control {control} failed: {reason}")]
    Control {
        control: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] Error),
}
