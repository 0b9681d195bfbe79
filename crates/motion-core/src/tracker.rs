//! Single-object tracker capability and the registry of named backends.
//!
//! A [`TrackerBackend`] is a constructor: given the frame and the box of a
//! freshly detected object it returns a [`Tracker`] bound to that object.
//! Backends are looked up by name at runtime, so the detector can switch
//! algorithms without knowing their concrete types. The built-in backends
//! wrap the OpenCV tracking module.

use std::sync::Arc;

use opencv::{
    core::{Mat, Ptr, Rect, Rect2d},
    prelude::*,
    tracking::{TrackerCSRT, TrackerKCF, TrackerKCF_Params, legacy_TrackerMOSSE},
};
use thiserror::Error;

use crate::geometry::BoundingBox;

/// Smallest box side the correlation filters can be seeded with.
const MIN_SEED_SIDE: u32 = 4;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("box {bbox:?} lies outside the {width}x{height} frame")]
    OutOfBounds {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },
    #[error("box {width}x{height} is below the {min}px minimum side")]
    TooSmall { width: u32, height: u32, min: u32 },
    #[error("no tracker backend named {0:?}")]
    UnknownBackend(String),
    #[error("{0} tracker refused the initial box")]
    Rejected(&'static str),
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

/// Handle bound to one object instance.
pub trait Tracker: Send {
    /// Locate the object in `frame`; `None` when it could not be found.
    fn update(&mut self, frame: &Mat) -> Option<BoundingBox>;
}

/// Named constructor for [`Tracker`]s.
pub trait TrackerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self, frame: &Mat, bbox: BoundingBox) -> Result<Box<dyn Tracker>, TrackerError>;
}

#[derive(Clone, Default)]
pub struct TrackerRegistry {
    backends: Vec<Arc<dyn TrackerBackend>>,
}

impl TrackerRegistry {
    /// Registry holding the OpenCV backends, CSRT first.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        for backend in [OpenCvBackend::Csrt, OpenCvBackend::Kcf, OpenCvBackend::Mosse] {
            registry.register(Arc::new(backend));
        }
        registry
    }

    /// Add a backend, replacing any existing one with the same name.
    pub fn register(&mut self, backend: Arc<dyn TrackerBackend>) {
        let name = backend.name();
        self.backends.retain(|existing| existing.name() != name);
        self.backends.push(backend);
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Result<Arc<dyn TrackerBackend>, TrackerError> {
        self.backends
            .iter()
            .find(|backend| backend.name().eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| TrackerError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    /// First registered backend.
    pub fn default_backend(&self) -> Option<Arc<dyn TrackerBackend>> {
        self.backends.first().cloned()
    }
}

/// Trackers from the OpenCV contrib tracking module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenCvBackend {
    /// Discriminative correlation filter with channel and spatial reliability.
    Csrt,
    /// Kernelized correlation filter; faster than CSRT, less robust to scale.
    Kcf,
    /// Minimum output sum of squared error filter (legacy API).
    Mosse,
}

impl TrackerBackend for OpenCvBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::Csrt => "CSRT",
            Self::Kcf => "KCF",
            Self::Mosse => "MOSSE",
        }
    }

    fn init(&self, frame: &Mat, bbox: BoundingBox) -> Result<Box<dyn Tracker>, TrackerError> {
        let (width, height) = (frame.cols() as u32, frame.rows() as u32);
        if !bbox.fits_within(width, height) {
            return Err(TrackerError::OutOfBounds {
                bbox,
                width,
                height,
            });
        }
        if bbox.width < MIN_SEED_SIDE || bbox.height < MIN_SEED_SIDE {
            return Err(TrackerError::TooSmall {
                width: bbox.width,
                height: bbox.height,
                min: MIN_SEED_SIDE,
            });
        }

        let rect = bbox.to_rect();
        match self {
            Self::Csrt => {
                let mut tracker = TrackerCSRT::create_def()?;
                tracker.init(frame, rect)?;
                Ok(Box::new(ModernTracker { tracker, rect }))
            }
            Self::Kcf => {
                let mut tracker = TrackerKCF::create(TrackerKCF_Params::default()?)?;
                tracker.init(frame, rect)?;
                Ok(Box::new(ModernTracker { tracker, rect }))
            }
            Self::Mosse => {
                let mut tracker = legacy_TrackerMOSSE::create()?;
                let rect = rect_to_2d(rect);
                if !tracker.init(frame, rect)? {
                    return Err(TrackerError::Rejected(self.name()));
                }
                Ok(Box::new(LegacyTracker { tracker, rect }))
            }
        }
    }
}

/// Tracker on the `cv::Tracker` interface (CSRT, KCF).
struct ModernTracker<T> {
    tracker: T,
    rect: Rect,
}

impl<T> Tracker for ModernTracker<T>
where
    T: TrackerTrait + Send,
{
    fn update(&mut self, frame: &Mat) -> Option<BoundingBox> {
        let mut rect = self.rect;
        match self.tracker.update(frame, &mut rect) {
            Ok(true) => {
                let (width, height) = (frame.cols() as u32, frame.rows() as u32);
                let bbox = BoundingBox::from_rect_clipped(rect, width, height)?;
                self.rect = rect;
                Some(bbox)
            }
            // A tracker that errors out has lost the object as far as the
            // detector is concerned.
            _ => None,
        }
    }
}

/// Tracker on the `cv::legacy::Tracker` interface (MOSSE).
struct LegacyTracker {
    tracker: Ptr<legacy_TrackerMOSSE>,
    rect: Rect2d,
}

impl Tracker for LegacyTracker {
    fn update(&mut self, frame: &Mat) -> Option<BoundingBox> {
        let mut rect = self.rect;
        match self.tracker.update(frame, &mut rect) {
            Ok(true) => {
                let rounded = Rect::new(
                    rect.x.round() as i32,
                    rect.y.round() as i32,
                    rect.width.round() as i32,
                    rect.height.round() as i32,
                );
                let (width, height) = (frame.cols() as u32, frame.rows() as u32);
                let bbox = BoundingBox::from_rect_clipped(rounded, width, height)?;
                self.rect = rect;
                Some(bbox)
            }
            _ => None,
        }
    }
}

fn rect_to_2d(rect: Rect) -> Rect2d {
    Rect2d::new(
        f64::from(rect.x),
        f64::from(rect.y),
        f64::from(rect.width),
        f64::from(rect.height),
    )
}
