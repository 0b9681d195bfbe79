//! Foreground regions of a binary mask, one per external contour.

use opencv::{
    core::{Mat, Point, Vector},
    imgproc::{self, CHAIN_APPROX_SIMPLE, RETR_EXTERNAL},
    prelude::*,
};

use crate::error::Result;
use crate::geometry::BoundingBox;

/// One connected blob of set pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Region {
    pub bbox: BoundingBox,
    /// Area enclosed by the outer contour.
    pub area: f64,
}

/// Outline every blob of non-zero pixels.
///
/// Regions come back in raster order of their bounding box corner.
pub fn find_regions(mask: &Mat) -> Result<Vec<Region>> {
    let (width, height) = (mask.cols() as u32, mask.rows() as u32);
    let mut scratch = mask.try_clone()?;
    let mut contours: Vector<Vector<Point>> = Vector::new();
    imgproc::find_contours(
        &mut scratch,
        &mut contours,
        RETR_EXTERNAL,
        CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut regions = Vec::with_capacity(contours.len());
    for contour in contours.iter() {
        let rect = imgproc::bounding_rect(&contour)?;
        let Some(bbox) = BoundingBox::from_rect_clipped(rect, width, height) else {
            continue;
        };
        let area = imgproc::contour_area(&contour, false)?;
        regions.push(Region { bbox, area });
    }
    regions.sort_by_key(|region| (region.bbox.y, region.bbox.x));
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use opencv::core::{self, Rect, Scalar};

    use super::*;

    fn mask_with(rects: &[Rect]) -> Mat {
        let mut mask =
            Mat::new_rows_cols_with_default(12, 12, core::CV_8UC1, Scalar::all(0.0)).unwrap();
        for rect in rects {
            imgproc::rectangle(
                &mut mask,
                *rect,
                Scalar::all(255.0),
                imgproc::FILLED,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        mask
    }

    #[test]
    fn separate_blobs_become_separate_regions() {
        let mask = mask_with(&[Rect::new(1, 4, 3, 3), Rect::new(8, 0, 2, 2)]);
        let regions = find_regions(&mask).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].bbox, BoundingBox::new(8, 0, 2, 2).unwrap());
        assert_eq!(regions[1].bbox, BoundingBox::new(1, 4, 3, 3).unwrap());
        assert!((regions[1].area - 4.0).abs() < 1e-6);
    }

    #[test]
    fn diagonal_neighbours_join_one_region() {
        let mut mask = mask_with(&[]);
        for i in 1..4 {
            *mask.at_2d_mut::<u8>(i, i).unwrap() = 255;
        }
        let regions = find_regions(&mask).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox, BoundingBox::new(1, 1, 3, 3).unwrap());
    }

    #[test]
    fn empty_mask_has_no_regions() {
        assert!(find_regions(&mask_with(&[])).unwrap().is_empty());
    }
}
