//! Morphological closing of foreground masks and a Sobel edge map for
//! diagnostics.

use opencv::{
    core::{self, BORDER_DEFAULT, Mat, Point, Scalar, Size},
    imgproc::{self, MORPH_CLOSE, MORPH_RECT},
    prelude::*,
};

use crate::error::Result;

/// Square-kernel closing (dilate then erode): fills pinholes and joins
/// fragments of one object.
pub fn close(mask: &Mat, radius: u32) -> Result<Mat> {
    if radius == 0 {
        return Ok(mask.try_clone()?);
    }
    let side = (2 * radius + 1) as i32;
    let kernel =
        imgproc::get_structuring_element(MORPH_RECT, Size::new(side, side), Point::new(-1, -1))?;
    let mut closed = Mat::default();
    imgproc::morphology_ex(
        mask,
        &mut closed,
        MORPH_CLOSE,
        &kernel,
        Point::new(-1, -1),
        1,
        BORDER_DEFAULT,
        Scalar::default(),
    )?;
    Ok(closed)
}

/// Sobel gradient magnitude, averaged over both axes, thresholded into a
/// binary edge map.
pub fn edge_map(image: &Mat, threshold: u8) -> Result<Mat> {
    let mut grad_x = Mat::default();
    let mut grad_y = Mat::default();
    imgproc::sobel_def(image, &mut grad_x, core::CV_16S, 1, 0)?;
    imgproc::sobel_def(image, &mut grad_y, core::CV_16S, 0, 1)?;

    let mut abs_x = Mat::default();
    let mut abs_y = Mat::default();
    core::convert_scale_abs_def(&grad_x, &mut abs_x)?;
    core::convert_scale_abs_def(&grad_y, &mut abs_y)?;

    let mut magnitude = Mat::default();
    core::add_weighted_def(&abs_x, 0.5, &abs_y, 0.5, 0.0, &mut magnitude)?;

    let mut edges = Mat::default();
    imgproc::threshold(
        &magnitude,
        &mut edges,
        f64::from(threshold),
        255.0,
        imgproc::THRESH_BINARY,
    )?;
    Ok(edges)
}
