//! Running-average background model.
//!
//! The model is a `CV_32F` accumulator. Learning blends the current frame in
//! with a caller-chosen rate through `accumulate_weighted`; foreground
//! extraction differences the frame against the rounded accumulator without
//! touching it, which is how the detector keeps the model frozen while
//! looking for motion.

use opencv::{
    core::{self, Mat, Scalar, Size},
    imgproc,
    prelude::*,
};

use crate::error::Result;

/// Default absolute luma difference for a pixel to count as foreground.
pub const DEFAULT_DIFF_THRESHOLD: u8 = 25;

pub struct BackgroundModel {
    size: Size,
    accumulator: Mat,
    threshold: u8,
}

impl BackgroundModel {
    /// Seed the model with `frame` as the initial background.
    pub fn new(frame: &Mat, threshold: u8) -> Result<Self> {
        let mut accumulator = Mat::default();
        frame.convert_to(&mut accumulator, core::CV_32F, 1.0, 0.0)?;
        Ok(Self {
            size: frame.size()?,
            accumulator,
            threshold,
        })
    }

    /// Whether `frame` can be used with this model.
    pub fn matches(&self, frame: &Mat) -> bool {
        frame.size().is_ok_and(|size| size == self.size)
    }

    /// Blend `frame` into the background: `acc = (1 - rate) * acc + rate * frame`.
    ///
    /// A rate of zero leaves the model untouched. Frames of a different size
    /// are ignored.
    pub fn learn(&mut self, frame: &Mat, rate: f32) -> Result<()> {
        if !self.matches(frame) || rate <= 0.0 {
            return Ok(());
        }
        imgproc::accumulate_weighted_def(frame, &mut self.accumulator, f64::from(rate.min(1.0)))?;
        Ok(())
    }

    /// Binary mask (0 / 255) of pixels differing from the background by more
    /// than the threshold. Frames of a different size yield an empty mask.
    pub fn foreground(&self, frame: &Mat) -> Result<Mat> {
        if !self.matches(frame) {
            return Ok(Mat::new_rows_cols_with_default(
                self.size.height,
                self.size.width,
                core::CV_8UC1,
                Scalar::all(0.0),
            )?);
        }
        let background = self.background_image()?;
        let mut diff = Mat::default();
        core::absdiff(&background, frame, &mut diff)?;
        let mut mask = Mat::default();
        imgproc::threshold(
            &diff,
            &mut mask,
            f64::from(self.threshold),
            255.0,
            imgproc::THRESH_BINARY,
        )?;
        Ok(mask)
    }

    /// Snapshot of the current background, rounded back to 8 bits.
    pub fn background_image(&self) -> Result<Mat> {
        let mut image = Mat::default();
        self.accumulator.convert_to(&mut image, core::CV_8U, 1.0, 0.0)?;
        Ok(image)
    }
}
