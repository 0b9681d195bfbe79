//! JPEG encoding and the meta-crossing stage.
//!
//! The meta-crossing worker turns confirmed crossings into transport-ready
//! payloads and hands them to the publisher queue. Its input queue is
//! unbounded so load never drops an event. An image that cannot be encoded
//! is logged, counted and replaced by a placeholder; the crossing itself
//! always reaches the publisher.

use std::{thread, time::Instant};

use anyhow::{Result, anyhow};
use crossbeam_channel::Receiver;
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use tracing::{error, info};
use video_ingest::Frame;

use crate::vision::{
    annotation::frame_to_rgb,
    data::{CROSSING_TIME_FORMAT, CrossingEvent, EncodedCrossing},
    publisher::PublishQueue,
    telemetry,
};

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn frame_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    encode_jpeg(&frame_to_rgb(frame)?, quality)
}

/// 1x1 black JPEG standing in for an image that could not be encoded.
fn placeholder_jpeg() -> Vec<u8> {
    encode_jpeg(&RgbImage::new(1, 1), 50).unwrap_or_default()
}

fn or_placeholder(part: &'static str, time: &str, jpeg: Result<Vec<u8>>) -> Vec<u8> {
    jpeg.unwrap_or_else(|err| {
        error!(part, "Failed to encode crossing image at {time}: {err:?}");
        metrics::counter!("linecam_encode_failures_total", "part" => part).increment(1);
        placeholder_jpeg()
    })
}

/// Encode the before/after frames and the diagnostic stack of one crossing.
pub(crate) fn encode_crossing(event: &CrossingEvent, quality: u8) -> EncodedCrossing {
    let time = event.timestamp.format(CROSSING_TIME_FORMAT).to_string();
    EncodedCrossing {
        previous_jpeg: or_placeholder("previous", &time, frame_jpeg(&event.previous, quality)),
        current_jpeg: or_placeholder("current", &time, frame_jpeg(&event.current, quality)),
        stack_jpeg: or_placeholder("stack", &time, encode_jpeg(&event.composite, quality)),
        direction: event.direction,
        time,
    }
}

/// Spawn the meta-crossing worker; it exits once the post-processing side of
/// its queue is closed and every pending event has been forwarded.
pub(crate) fn spawn_meta_worker(
    events: Receiver<CrossingEvent>,
    queue: PublishQueue,
    jpeg_quality: u8,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("linecam-meta", move || {
        let worker_span = tracing::info_span!("meta.worker", jpeg_quality);
        let _worker_guard = worker_span.enter();
        for event in events {
            let encode_start = Instant::now();
            let payload = encode_crossing(&event, jpeg_quality);
            metrics::histogram!("linecam_stage_latency_seconds", "stage" => "meta")
                .record(encode_start.elapsed().as_secs_f64());
            info!(
                time = %payload.time,
                direction = payload.direction.label(),
                "Crossing queued for delivery"
            );
            if queue.push(payload).is_err() {
                error!("Publisher stopped; crossing at {} not delivered", event.timestamp);
            }
        }
    })
    .expect("failed to spawn meta-crossing worker")
}
