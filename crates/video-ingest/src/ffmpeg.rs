//! FFmpeg subprocess readers producing raw BGR frames.
//!
//! Each reader decodes on a child process and pipes `rawvideo` BGR24 into a
//! background thread, which slices the byte stream into [`Frame`]s and
//! forwards them over a small bounded channel. The channel backpressures the
//! reader when the pipeline falls behind so stale frames are not buffered.

use std::{
    io::Read,
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameFormat};

/// Capacity of the reader → consumer channel.
const READER_QUEUE: usize = 2;

/// Spawn a reader for a local V4L2 device (`/dev/videoN` or a bare index).
pub fn spawn_device_reader(
    device: &str,
    target_size: (i32, i32),
    fps: u32,
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let device = device_path(device);
    let mut cmd = base_command();
    cmd.arg("-f")
        .arg("video4linux2")
        .arg("-input_format")
        .arg("mjpeg")
        .arg("-video_size")
        .arg(format!("{}x{}", target_size.0, target_size.1))
        .arg("-framerate")
        .arg(fps.to_string())
        .arg("-i")
        .arg(&device);
    push_output_args(&mut cmd, target_size);

    debug!("Starting V4L2 capture on {device}");
    spawn_ffmpeg_reader(cmd, target_size)
}

/// Spawn a low-latency RTSP reader over TCP transport.
pub fn spawn_rtsp_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let mut cmd = base_command();
    cmd.arg("-rtsp_transport")
        .arg("tcp")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-flags")
        .arg("low_delay")
        .arg("-max_delay")
        .arg("0")
        .arg("-i")
        .arg(uri);
    push_output_args(&mut cmd, target_size);

    spawn_ffmpeg_reader(cmd, target_size)
}

/// Spawn a reader replaying a recorded file at its native frame rate.
pub fn spawn_file_reader(
    path: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let mut cmd = base_command();
    cmd.arg("-re").arg("-i").arg(path);
    push_output_args(&mut cmd, target_size);

    spawn_ffmpeg_reader(cmd, target_size)
}

/// Map a bare device index (`"0"`) to its V4L2 path.
pub(crate) fn device_path(device: &str) -> String {
    match parse_device_index(device) {
        Some(index) => format!("/dev/video{index}"),
        None => device.to_string(),
    }
}

pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}

fn base_command() -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    cmd
}

fn push_output_args(cmd: &mut Command, target_size: (i32, i32)) {
    cmd.arg("-an")
        .arg("-vf")
        .arg(format!("scale={}:{}", target_size.0, target_size.1))
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
}

fn spawn_ffmpeg_reader(
    mut cmd: Command,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    if target_size.0 <= 0 || target_size.1 <= 0 {
        return Err(anyhow!(
            "capture size must be positive, got {}x{}",
            target_size.0,
            target_size.1
        ));
    }

    let (tx, rx) = bounded(READER_QUEUE);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || {
            let tx_clone = tx.clone();
            if let Err(err) = ffmpeg_loop(stdout, child, target_size, tx_clone) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    mut child: Child,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let result = read_frames(&mut stdout, &mut buffer, target_size, &tx);
    let _ = child.kill();
    let _ = child.wait();
    result
}

fn read_frames(
    stdout: &mut impl Read,
    buffer: &mut [u8],
    target_size: (i32, i32),
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    loop {
        match stdout.read_exact(buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.to_vec(),
                    width: target_size.0,
                    height: target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                if tx.send(Ok(frame)).is_err() {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CaptureError::Closed);
            }
            Err(err) => return Err(CaptureError::Other(err.into())),
        }
    }
}
