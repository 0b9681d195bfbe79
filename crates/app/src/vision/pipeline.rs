//! Pipeline supervisor tying together capture, the controller, post-processing,
//! crossing delivery and the preview server.
//!
//! The supervisor owns channel wiring and shutdown ordering. A stalled stage
//! or a dead frame source ends the run with an error; restarting the process
//! is left to the service manager.

use std::{
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use motion_core::TrackerRegistry;
use tracing::{info, warn};

use crate::vision::{
    LineCamConfig,
    control::{CONTROL_REPLY_TIMEOUT, control_channel},
    controller::{Controller, ControllerLinks, ControllerSettings, spawn_controller_worker},
    data::{SharedFrame, SharedStatus},
    encoding::spawn_meta_worker,
    processing::{PostProcessLinks, spawn_postprocess_worker},
    publisher::{HttpCollector, publish_channel, spawn_publisher},
    server::{ServerState, spawn_preview_server, spawn_stream_forwarder},
    telemetry,
    watchdog::{PipelineHealth, WatchdogState, spawn_watchdog},
};

const SUPERVISOR_POLL: Duration = Duration::from_millis(100);
const OUTPUT_QUEUE: usize = 2;
const STREAM_QUEUE: usize = 2;

/// Run the detector until Ctrl+C, a stalled stage or a capture failure.
pub fn run(config: LineCamConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("Prometheus metrics unavailable: {err}");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let abandon = Arc::new(AtomicBool::new(false));
    let (handler_shutdown, handler_abandon) = (shutdown.clone(), abandon.clone());
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            if handler_shutdown.swap(true, Ordering::SeqCst) {
                handler_abandon.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let pipeline_span = tracing::info_span!(
        "linecam.pipeline",
        source = %config.source_uri,
        width = config.width,
        height = config.height,
        downscale = config.downscale,
        tracker = %config.params.tracker
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let (source, camera) = video_ingest::open_source(
        &config.source_uri,
        (config.width as i32, config.height as i32),
        config.fps,
        config.capture_timeout,
    )
    .with_context(|| format!("Failed to start capture from {}", config.source_uri))?;
    info!(
        "Capturing {} ({:?}) at {}x{}",
        config.source_uri, config.source_kind, config.width, config.height
    );

    let registry = TrackerRegistry::with_defaults();
    let trackers = registry.names();
    let mut settings =
        ControllerSettings::new(config.width, config.height, config.downscale, config.timings);
    settings.diff_threshold = config.diff_threshold;
    settings.composite_every = config.composite_every;
    let controller = Controller::new(
        config.params.clone(),
        registry,
        camera,
        settings,
        Instant::now(),
    )
    .context("Failed to initialise controller")?;

    let collector = HttpCollector::new(
        &config.publisher.collector_url,
        &config.publisher.lap_id,
        config.publisher.request_timeout,
    )?;
    info!("Publishing crossings to {}", collector.endpoint());

    let latest: SharedFrame = Arc::new(Mutex::new(None));
    let composite: SharedFrame = Arc::new(Mutex::new(None));
    let status: SharedStatus = Arc::new(Mutex::new(None));
    let (output_tx, output_rx) = crossbeam_channel::bounded(OUTPUT_QUEUE);
    let (stream_tx, stream_rx) = crossbeam_channel::bounded(STREAM_QUEUE);
    let (meta_tx, meta_rx) = crossbeam_channel::unbounded();
    let (publish_queue, publish_rx) = publish_channel();
    let pending = publish_queue.pending_counter();
    let (control, commands) = control_channel(CONTROL_REPLY_TIMEOUT);

    let health = Arc::new(PipelineHealth::new());
    let running = Arc::new(AtomicBool::new(true));
    let watchdog_state = Arc::new(WatchdogState::new());

    let publisher_handle = spawn_publisher(
        publish_rx,
        pending.clone(),
        Box::new(collector),
        config.publisher.retry_delay,
        abandon.clone(),
    );
    let meta_handle = spawn_meta_worker(meta_rx, publish_queue, config.jpeg_quality);
    let postprocess_handle = spawn_postprocess_worker(
        PostProcessLinks {
            outputs: output_rx,
            stream_tx,
            meta_tx,
            health: health.clone(),
        },
        config.jpeg_quality,
    );
    let forwarder_handle = spawn_stream_forwarder(stream_rx, latest.clone(), composite.clone());

    let preview_server = spawn_preview_server(
        &config.server,
        ServerState {
            latest,
            composite,
            status: status.clone(),
            control,
            trackers,
            pending: pending.clone(),
        },
    )
    .context("Failed to start preview server")?;

    let watchdog_handle = spawn_watchdog(health.clone(), running.clone(), watchdog_state.clone());
    let controller_handle = spawn_controller_worker(
        controller,
        ControllerLinks {
            source,
            commands,
            output_tx,
            status,
            health,
            running: running.clone(),
        },
    );
    info!("Running line-crossing detector; press Ctrl+C to stop");

    while running.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested");
            break;
        }
        thread::sleep(SUPERVISOR_POLL);
    }
    running.store(false, Ordering::SeqCst);

    let capture_outcome = controller_handle
        .join()
        .map_err(|_| anyhow!("controller thread panicked"))?;
    let _ = postprocess_handle.join();
    let _ = forwarder_handle.join();
    let _ = meta_handle.join();

    if config.publisher.abandon_on_exit {
        abandon.store(true, Ordering::SeqCst);
    }
    let undelivered = pending.load(Ordering::SeqCst);
    if undelivered > 0 && !abandon.load(Ordering::SeqCst) {
        info!("Waiting for {undelivered} crossing(s) to reach the collector; Ctrl+C again to abandon");
    }
    let _ = publisher_handle.join();
    let _ = watchdog_handle.join();
    preview_server.stop();

    if watchdog_state.is_triggered() {
        let reason = watchdog_state
            .reason()
            .map(|component| component.label())
            .unwrap_or("unknown");
        bail!("Watchdog stopped the pipeline: {reason} stage stalled");
    }
    capture_outcome.context("Frame source failed")?;

    info!("Line-crossing detector stopped");
    Ok(())
}
