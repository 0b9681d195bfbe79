//! Motion segmentation and single-object tracking primitives on OpenCV.
//!
//! Everything here operates on the downscaled grayscale sub-frame produced by
//! [`prepare::prepare_subframe`]; coordinates are sub-frame pixels.

pub mod background;
pub mod error;
pub mod geometry;
pub mod morphology;
pub mod prepare;
pub mod regions;
pub mod tracker;

pub use background::{BackgroundModel, DEFAULT_DIFF_THRESHOLD};
pub use error::{MotionError, Result};
pub use geometry::BoundingBox;
pub use opencv::core::Mat;
pub use regions::{Region, find_regions};
pub use tracker::{OpenCvBackend, Tracker, TrackerBackend, TrackerError, TrackerRegistry};
