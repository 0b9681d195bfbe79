//! Post-processing worker: overlays, composites and crossing hand-off.
//!
//! The worker never touches controller state. For every controller output it
//! renders the annotated preview frame, builds the diagnostic composite when
//! the controller attached diagnostics, and forwards confirmed crossings to
//! the meta-crossing stage before anything that could fail.

use std::{
    sync::Arc,
    thread,
    time::Instant,
};

use crossbeam_channel::{Receiver, SendError, Sender, TrySendError};
use image::RgbImage;
use tracing::{debug, error, warn};

use crate::vision::{
    annotation::{annotate_output, build_composite},
    data::{ControllerOutput, CrossingEvent, FramePacket, StreamPacket},
    encoding::encode_jpeg,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Hand a controller output to post-processing.
///
/// Outputs carrying a crossing block until accepted; anything else is
/// dropped when the queue is full.
pub(crate) fn forward_output(
    tx: &Sender<ControllerOutput>,
    output: ControllerOutput,
) -> Result<(), SendError<ControllerOutput>> {
    if output.crossing.is_some() {
        return tx.send(output);
    }
    match tx.try_send(output) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            metrics::counter!("linecam_diagnostic_dropped_frames_total").increment(1);
            Ok(())
        }
        Err(TrySendError::Disconnected(output)) => Err(SendError(output)),
    }
}

/// Offer a packet to the preview queue, dropping it when the queue is full.
/// Returns whether the packet was queued.
pub(crate) fn offer_stream(tx: &Sender<StreamPacket>, packet: StreamPacket) -> bool {
    match tx.try_send(packet) {
        Ok(()) => true,
        Err(TrySendError::Full(packet)) => {
            metrics::counter!("linecam_stream_dropped_frames_total").increment(1);
            debug!("Preview queue full; dropping frame #{}", packet.frame_number());
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Build the meta-crossing payload for an output that carries a crossing.
pub(crate) fn crossing_event(
    output: &ControllerOutput,
    composite: Option<&RgbImage>,
) -> Option<CrossingEvent> {
    let crossing = output.crossing.as_ref()?;
    let composite = match composite {
        Some(image) => image.clone(),
        None => {
            warn!("Crossing on frame #{} has no diagnostics", output.frame_number);
            RgbImage::new(1, 1)
        }
    };
    Some(CrossingEvent {
        timestamp: crossing.timestamp,
        direction: crossing.direction,
        previous: crossing.previous.clone(),
        current: Arc::clone(&output.frame),
        composite,
    })
}

pub(crate) struct PostProcessLinks {
    pub(crate) outputs: Receiver<ControllerOutput>,
    pub(crate) stream_tx: Sender<StreamPacket>,
    pub(crate) meta_tx: Sender<CrossingEvent>,
    pub(crate) health: Arc<PipelineHealth>,
}

/// Spawn the post-processing worker; it exits once the controller hangs up.
pub(crate) fn spawn_postprocess_worker(
    links: PostProcessLinks,
    jpeg_quality: u8,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("linecam-postprocess", move || {
        let PostProcessLinks {
            outputs,
            stream_tx,
            meta_tx,
            health,
        } = links;
        let worker_span = tracing::info_span!("postprocess.worker", jpeg_quality);
        let _worker_guard = worker_span.enter();

        for output in outputs {
            health.beat(HealthComponent::PostProcess);
            let stage_start = Instant::now();
            let composite = output.diagnostics.as_ref().map(build_composite);

            if let Some(event) = crossing_event(&output, composite.as_ref()) {
                if meta_tx.send(event).is_err() {
                    error!(
                        "Meta-crossing stage stopped; crossing on frame #{} lost",
                        output.frame_number
                    );
                }
            }

            let timestamp_ms = output.frame.timestamp_ms;
            match annotate_output(&output).and_then(|image| encode_jpeg(&image, jpeg_quality)) {
                Ok(jpeg) => {
                    offer_stream(
                        &stream_tx,
                        StreamPacket::Live(FramePacket {
                            jpeg,
                            frame_number: output.frame_number,
                            timestamp_ms,
                        }),
                    );
                }
                Err(err) => warn!("Failed to render frame #{}: {err:?}", output.frame_number),
            }

            if let Some(composite) = composite {
                match encode_jpeg(&composite, jpeg_quality) {
                    Ok(jpeg) => {
                        offer_stream(
                            &stream_tx,
                            StreamPacket::Composite(FramePacket {
                                jpeg,
                                frame_number: output.frame_number,
                                timestamp_ms,
                            }),
                        );
                    }
                    Err(err) => warn!("Failed to encode composite: {err:?}"),
                }
            }

            metrics::histogram!("linecam_stage_latency_seconds", "stage" => "postprocess")
                .record(stage_start.elapsed().as_secs_f64());
        }
        debug!("Post-processing drained");
    })
    .expect("failed to spawn post-processing worker")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Local;
    use crossbeam_channel::bounded;
    use image::GrayImage;
    use video_ingest::{Frame, FrameFormat};

    use super::*;
    use crate::vision::data::{
        CrossingDetection, CrossingDirection, Diagnostics, Mode, RuntimeParameters,
    };

    fn frame(value: u8) -> Arc<Frame> {
        Arc::new(Frame {
            data: vec![value; 80 * 60 * 3],
            width: 80,
            height: 60,
            timestamp_ms: 1_000,
            format: FrameFormat::Bgr8,
        })
    }

    fn output(frame_number: u64, crossing: bool, diagnostics: bool) -> ControllerOutput {
        ControllerOutput {
            frame: frame(90),
            frame_number,
            fps: 29.5,
            mode: Mode::Tracking,
            mode_elapsed: Duration::from_millis(1_200),
            bbox: None,
            params: RuntimeParameters {
                line_x: 40,
                min_y_pct: 10,
                max_y_pct: 90,
                band: 0.15,
                min_area: 0.003,
                tracker: "CSRT".into(),
            },
            tracker: "CSRT",
            crossing: crossing.then(|| CrossingDetection {
                direction: CrossingDirection::Right,
                timestamp: Local::now(),
                previous: frame(30),
            }),
            diagnostics: diagnostics.then(|| Diagnostics {
                background: GrayImage::new(40, 30),
                subframe: GrayImage::new(40, 30),
                mask: GrayImage::new(40, 30),
                edges: GrayImage::new(40, 30),
                line_x: 20,
            }),
        }
    }

    fn live(frame_number: u64) -> StreamPacket {
        StreamPacket::Live(FramePacket {
            jpeg: vec![0xFF, 0xD8],
            frame_number,
            timestamp_ms: 0,
        })
    }

    #[test]
    fn full_preview_queue_drops_the_newest_frame() {
        let (tx, rx) = bounded(2);
        assert!(offer_stream(&tx, live(1)));
        assert!(offer_stream(&tx, live(2)));
        assert!(!offer_stream(&tx, live(3)));

        let delivered: Vec<u64> = rx.try_iter().map(|packet| packet.frame_number()).collect();
        assert_eq!(delivered, vec![1, 2]);
    }

    #[test]
    fn plain_outputs_are_dropped_when_post_processing_lags() {
        let (tx, rx) = bounded(1);
        forward_output(&tx, output(1, false, false)).unwrap();
        forward_output(&tx, output(2, false, false)).unwrap();
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().unwrap().frame_number, 1);

        drop(rx);
        assert!(forward_output(&tx, output(3, false, false)).is_err());
    }

    #[test]
    fn crossing_outputs_wait_for_room() {
        let (tx, rx) = bounded(1);
        forward_output(&tx, output(1, false, false)).unwrap();
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            rx.iter().map(|output| output.frame_number).collect::<Vec<_>>()
        });
        forward_output(&tx, output(2, true, true)).unwrap();
        drop(tx);
        assert_eq!(consumer.join().unwrap(), vec![1, 2]);
    }

    #[test]
    fn worker_streams_frames_and_forwards_crossings() {
        let (output_tx, output_rx) = bounded(2);
        let (stream_tx, stream_rx) = bounded(8);
        let (meta_tx, meta_rx) = crossbeam_channel::unbounded();
        let worker = spawn_postprocess_worker(
            PostProcessLinks {
                outputs: output_rx,
                stream_tx,
                meta_tx,
                health: Arc::new(PipelineHealth::new()),
            },
            80,
        );

        output_tx.send(output(7, false, false)).unwrap();
        output_tx.send(output(8, true, true)).unwrap();
        drop(output_tx);
        worker.join().unwrap();

        let packets: Vec<StreamPacket> = stream_rx.try_iter().collect();
        assert_eq!(packets.len(), 3);
        assert!(matches!(&packets[0], StreamPacket::Live(p) if p.frame_number == 7));
        assert!(matches!(&packets[1], StreamPacket::Live(p) if p.frame_number == 8));
        assert!(matches!(&packets[2], StreamPacket::Composite(p) if p.frame_number == 8));

        let event = meta_rx.try_recv().expect("crossing forwarded");
        assert_eq!(event.direction, CrossingDirection::Right);
        assert_eq!(event.previous.data[0], 30);
        assert_eq!(event.current.data[0], 90);
        assert!(event.composite.width() > 1);
        assert!(meta_rx.try_recv().is_err());
    }
}
