//! Conversion of captured BGR frames into the blurred grayscale sub-frame the
//! detector works on.

use image::GrayImage;
use opencv::{
    core::{self, Mat, Scalar, Size},
    imgproc,
    prelude::*,
};

use crate::error::{MotionError, Result};

/// Copy a packed BGR buffer into an 8-bit three channel `Mat`.
fn bgr_mat(bgr: &[u8], width: u32, height: u32) -> Result<Mat> {
    let expected = width as usize * height as usize * 3;
    if bgr.len() != expected || expected == 0 {
        return Err(MotionError::BufferSize {
            width,
            height,
            expected,
            actual: bgr.len(),
        });
    }
    let mut mat = Mat::new_rows_cols_with_default(
        height as i32,
        width as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(bgr);
    Ok(mat)
}

/// Gray, area-downscale by `factor` and Gaussian blur a BGR frame.
///
/// Trailing rows and columns that do not fill a whole block are dropped, so
/// the result is exactly `width / factor` x `height / factor`. A blur radius
/// of zero skips the blur.
pub fn prepare_subframe(
    bgr: &[u8],
    width: u32,
    height: u32,
    factor: u32,
    blur_radius: u32,
) -> Result<Mat> {
    let frame = bgr_mat(bgr, width, height)?;
    let factor = factor.max(1);
    let (out_w, out_h) = (width / factor, height / factor);
    if out_w == 0 || out_h == 0 {
        return Err(MotionError::Downscale {
            factor,
            width,
            height,
        });
    }

    let mut gray = Mat::default();
    imgproc::cvt_color(
        &frame,
        &mut gray,
        imgproc::COLOR_BGR2GRAY,
        0,
        core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;

    let mut small = if factor > 1 {
        let cropped = Mat::roi(
            &gray,
            core::Rect::new(0, 0, (out_w * factor) as i32, (out_h * factor) as i32),
        )?
        .try_clone()?;
        let mut small = Mat::default();
        imgproc::resize(
            &cropped,
            &mut small,
            Size::new(out_w as i32, out_h as i32),
            0.0,
            0.0,
            imgproc::INTER_AREA,
        )?;
        small
    } else {
        gray
    };

    if blur_radius > 0 {
        let side = (2 * blur_radius + 1) as i32;
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&small, &mut blurred, Size::new(side, side), 0.0)?;
        small = blurred;
    }
    Ok(small)
}

/// Copy an 8-bit single channel `Mat` out into an owned [`GrayImage`].
pub fn to_gray_image(mat: &Mat) -> Result<GrayImage> {
    let layout = || MotionError::Layout {
        mat_type: mat.typ(),
        cols: mat.cols(),
        rows: mat.rows(),
    };
    if mat.typ() != core::CV_8UC1 || mat.empty() {
        return Err(layout());
    }
    let continuous;
    let source = if mat.is_continuous() {
        mat
    } else {
        continuous = mat.try_clone()?;
        &continuous
    };
    let bytes = source.data_bytes()?.to_vec();
    GrayImage::from_raw(mat.cols() as u32, mat.rows() as u32, bytes).ok_or_else(layout)
}
