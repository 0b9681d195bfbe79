//! Blocking frame-source capability over the channel-backed readers.

use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::{
    control::{CameraControl, NoopControl, V4l2Control},
    ffmpeg::{
        device_path, parse_device_index, spawn_device_reader, spawn_file_reader,
        spawn_rtsp_reader,
    },
    types::{CaptureError, Frame},
};

/// Produces the next available frame, blocking until one arrives.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L2 devices.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// Pre-recorded files replayed in real time.
    File,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if parse_device_index(uri).is_some() {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }
}

/// Frame source draining a reader channel with a stall timeout.
pub struct ChannelSource {
    rx: Receiver<Result<Frame, CaptureError>>,
    timeout: Duration,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Result<Frame, CaptureError>>, timeout: Duration) -> Self {
        Self { rx, timeout }
    }
}

impl FrameSource for ChannelSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Stalled(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }
}

/// Open the source for `uri` along with the controls it supports.
pub fn open_source(
    uri: &str,
    target_size: (i32, i32),
    fps: u32,
    timeout: Duration,
) -> Result<(Box<dyn FrameSource>, Box<dyn CameraControl>)> {
    let (rx, control): (_, Box<dyn CameraControl>) = match SourceKind::from_uri(uri) {
        SourceKind::Device => (
            spawn_device_reader(uri, target_size, fps)?,
            Box::new(V4l2Control::new(device_path(uri))),
        ),
        SourceKind::Rtsp => (spawn_rtsp_reader(uri, target_size)?, Box::new(NoopControl)),
        SourceKind::File => (spawn_file_reader(uri, target_size)?, Box::new(NoopControl)),
    };
    Ok((Box::new(ChannelSource::new(rx, timeout)), control))
}
