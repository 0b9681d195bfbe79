//! Configuration parsing for the line-crossing detector.
//!
//! This module owns translation of CLI arguments (with `LINECAM_*` environment
//! fallbacks) into a validated `LineCamConfig` which downstream stages use
//! without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use motion_core::{DEFAULT_DIFF_THRESHOLD, TrackerRegistry};
use video_ingest::SourceKind;

use crate::vision::data::{RuntimeParameters, Timings};

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct LineCamConfig {
    /// V4L2 device, RTSP URI or file path.
    pub source_uri: String,
    pub source_kind: SourceKind,
    /// Capture width streamed by the ingest component.
    pub width: u32,
    /// Capture height streamed by the ingest component.
    pub height: u32,
    pub fps: u32,
    /// Integer sub-frame scaling factor.
    pub downscale: u32,
    /// Per-pixel difference above which a pixel counts as foreground.
    pub diff_threshold: u8,
    /// Geometry and tracker the controller starts with.
    pub params: RuntimeParameters,
    pub timings: Timings,
    pub composite_every: u64,
    pub capture_timeout: Duration,
    pub publisher: PublisherOptions,
    pub server: ServerOptions,
    pub jpeg_quality: u8,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
/// Collector endpoint and delivery policy.
pub struct PublisherOptions {
    pub collector_url: String,
    pub lap_id: String,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    /// Drop undelivered crossings on shutdown instead of draining them.
    pub abandon_on_exit: bool,
}

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub bind: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Default to debug level when `RUST_LOG` is unset.
    pub verbose: bool,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// V4L2 device path or index, rtsp:// URI, or a video file.
    #[arg(long, env = "LINECAM_SOURCE", default_value = "/dev/video0", value_name = "URI")]
    pub source: String,
    /// Capture width in pixels.
    #[arg(long, env = "LINECAM_WIDTH", default_value_t = 640, value_name = "PX")]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long, env = "LINECAM_HEIGHT", default_value_t = 480, value_name = "PX")]
    pub height: u32,
    /// Requested capture frame rate.
    #[arg(long, env = "LINECAM_FPS", default_value_t = 30)]
    pub fps: u32,
    /// Sub-frame scaling factor used for detection and tracking.
    #[arg(long, env = "LINECAM_DOWNSCALE", default_value_t = 2, value_name = "N")]
    pub downscale: u32,
    /// Detection line position in full-resolution pixels (defaults to the centre).
    #[arg(long = "line-x", env = "LINECAM_LINE_X", value_name = "PX")]
    pub line_x: Option<u32>,
    /// Top of the vertical acceptance band, percent of frame height.
    #[arg(long = "min-y", env = "LINECAM_MIN_Y", default_value_t = 0, value_name = "PCT")]
    pub min_y: u32,
    /// Bottom of the vertical acceptance band, percent of frame height.
    #[arg(long = "max-y", env = "LINECAM_MAX_Y", default_value_t = 100, value_name = "PCT")]
    pub max_y: u32,
    /// Half width of the acceptance band around the line, fraction of frame width.
    #[arg(long, env = "LINECAM_BAND", default_value_t = 0.15, value_name = "FRACTION")]
    pub band: f32,
    /// Minimum candidate area, fraction of the sub-frame area.
    #[arg(long = "min-area", env = "LINECAM_MIN_AREA", default_value_t = 0.003, value_name = "FRACTION")]
    pub min_area: f32,
    /// Foreground difference threshold (0-255).
    #[arg(long = "diff-threshold", env = "LINECAM_DIFF_THRESHOLD", default_value_t = DEFAULT_DIFF_THRESHOLD)]
    pub diff_threshold: u8,
    /// Tracker backend (see `linecam trackers`).
    #[arg(long, env = "LINECAM_TRACKER", default_value = "CSRT")]
    pub tracker: String,
    #[arg(long = "cooldown-secs", env = "LINECAM_COOLDOWN_SECS", default_value_t = 3.0)]
    pub cooldown_secs: f64,
    /// Maximum time a single object may be tracked.
    #[arg(long = "dwell-secs", env = "LINECAM_DWELL_SECS", default_value_t = 10.0)]
    pub dwell_secs: f64,
    /// Tolerated run of tracker update failures.
    #[arg(long = "resilience-ms", env = "LINECAM_RESILIENCE_MS", default_value_t = 500)]
    pub resilience_ms: u64,
    /// Base URL of the crossing collector.
    #[arg(long = "collector-url", env = "LINECAM_COLLECTOR_URL", default_value = "http://127.0.0.1:8080")]
    pub collector_url: String,
    #[arg(long = "lap-id", env = "LINECAM_LAP_ID", default_value = "1")]
    pub lap_id: String,
    /// Delay between delivery attempts of a failed crossing.
    #[arg(long = "retry-secs", env = "LINECAM_RETRY_SECS", default_value_t = 10.0)]
    pub retry_secs: f64,
    /// JPEG quality used by the encoders (1-100).
    #[arg(long = "jpeg-quality", env = "LINECAM_JPEG_QUALITY", default_value_t = 85, value_name = "QUALITY")]
    pub jpeg_quality: u8,
    /// Preview and control server bind address.
    #[arg(long, env = "LINECAM_BIND", default_value = "0.0.0.0")]
    pub bind: String,
    #[arg(long, env = "LINECAM_PORT", default_value_t = 5000)]
    pub port: u16,
    /// Refresh the diagnostic composite every N frames.
    #[arg(long = "composite-every", env = "LINECAM_COMPOSITE_EVERY", default_value_t = 30, value_name = "FRAMES")]
    pub composite_every: u64,
    /// Drop undelivered crossings on shutdown.
    #[arg(long = "abandon-on-exit", env = "LINECAM_ABANDON_ON_EXIT", action = clap::ArgAction::SetTrue)]
    pub abandon_on_exit: bool,
    /// Enable verbose logging.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<RunArgs> for LineCamConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        if args.fps == 0 {
            bail!("--fps must be at least 1");
        }
        if args.downscale == 0 {
            bail!("--downscale must be at least 1");
        }
        if args.width / args.downscale == 0 || args.height / args.downscale == 0 {
            bail!(
                "--downscale {} leaves no sub-frame for {}x{}",
                args.downscale,
                args.width,
                args.height
            );
        }

        let line_x = args.line_x.unwrap_or(args.width / 2);
        if line_x >= args.width {
            bail!("--line-x {line_x} lies outside the {}px wide frame", args.width);
        }
        if args.max_y > 100 {
            bail!("--max-y must be a percentage between 0 and 100");
        }
        if args.min_y >= args.max_y {
            bail!("--min-y ({}) must be below --max-y ({})", args.min_y, args.max_y);
        }
        if !(args.band > 0.0 && args.band <= 1.0) {
            bail!("--band must be a fraction in (0, 1]");
        }
        if !(args.min_area > 0.0 && args.min_area <= 1.0) {
            bail!("--min-area must be a fraction in (0, 1]");
        }

        let registry = TrackerRegistry::with_defaults();
        let tracker = match registry.get(&args.tracker) {
            Ok(backend) => backend.name().to_string(),
            Err(_) => bail!(
                "Unknown tracker backend {:?} (available: {})",
                args.tracker,
                registry.names().join(", ")
            ),
        };

        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.composite_every == 0 {
            bail!("--composite-every must be at least 1");
        }

        let timings = Timings {
            cooldown: seconds("--cooldown-secs", args.cooldown_secs)?,
            dwell: seconds("--dwell-secs", args.dwell_secs)?,
            resilience: Duration::from_millis(args.resilience_ms),
        };
        let retry_delay = seconds("--retry-secs", args.retry_secs)?;
        if retry_delay.is_zero() {
            bail!("--retry-secs must be positive");
        }
        if args.collector_url.trim().is_empty() {
            bail!("--collector-url must not be empty");
        }

        let source_kind = SourceKind::from_uri(&args.source);

        Ok(Self {
            source_uri: args.source,
            source_kind,
            width: args.width,
            height: args.height,
            fps: args.fps,
            downscale: args.downscale,
            diff_threshold: args.diff_threshold,
            params: RuntimeParameters {
                line_x,
                min_y_pct: args.min_y,
                max_y_pct: args.max_y,
                band: args.band,
                min_area: args.min_area,
                tracker,
            },
            timings,
            composite_every: args.composite_every,
            capture_timeout: Duration::from_secs(5),
            publisher: PublisherOptions {
                collector_url: args.collector_url,
                lap_id: args.lap_id,
                retry_delay,
                request_timeout: Duration::from_secs(10),
                abandon_on_exit: args.abandon_on_exit,
            },
            server: ServerOptions {
                bind: args.bind,
                port: args.port,
            },
            jpeg_quality: args.jpeg_quality,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        })
    }
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => Ok(duration),
        Err(_) => bail!("{flag} must be a non-negative number of seconds"),
    }
}
