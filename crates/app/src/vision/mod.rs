//! Line-crossing pipeline: capture, detection state machine, overlays,
//! crossing delivery and the preview/control HTTP surface.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Wires the stages together and orders shutdown.
//! - `controller`: Detection state machine owning background and tracker.
//! - `decision`: Candidate selection and line-crossing geometry.
//! - `control`: Command channel between HTTP handlers and the controller.
//! - `processing`: Post-processing worker and queue disciplines.
//! - `annotation`: Overlay and diagnostic composite drawing.
//! - `encoding`: JPEG encoding and the meta-crossing worker.
//! - `publisher`: At-least-once crossing delivery to the collector.
//! - `server`: Actix Web preview and control endpoints.
//! - `watchdog`: Health monitoring for pipeline stages.
//! - `data`: Shared structs passed between stages.

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use config::{LineCamConfig, RunArgs};
/// Launch the pipeline with a ready-made configuration.
pub use pipeline::run;

mod annotation;
mod config;
mod control;
mod controller;
mod data;
mod decision;
mod encoding;
mod pipeline;
mod processing;
mod publisher;
mod server;
mod telemetry;
mod watchdog;
