//! Candidate selection and line-crossing tests, all in sub-frame pixels.

use motion_core::{BoundingBox, Region};

use crate::vision::data::{CrossingDirection, RuntimeParameters};

/// Acceptance geometry resolved against one sub-frame size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DetectionGeometry {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) line_x: f32,
    pub(crate) band_half: f32,
    pub(crate) y_lo: f32,
    pub(crate) y_hi: f32,
    pub(crate) min_area: u64,
}

impl DetectionGeometry {
    pub(crate) fn new(params: &RuntimeParameters, width: u32, height: u32, downscale: u32) -> Self {
        let area = f64::from(width) * f64::from(height);
        Self {
            width,
            height,
            line_x: params.line_x as f32 / downscale.max(1) as f32,
            band_half: params.band * width as f32,
            y_lo: params.min_y_pct as f32 / 100.0 * height as f32,
            y_hi: params.max_y_pct as f32 / 100.0 * height as f32,
            min_area: ((f64::from(params.min_area) * area).ceil() as u64).max(1),
        }
    }

    /// Area floor, horizontal band around the line and vertical band.
    pub(crate) fn accepts(&self, bbox: &BoundingBox) -> bool {
        bbox.area() >= self.min_area
            && bbox.overlaps_horizontal(self.line_x - self.band_half, self.line_x + self.band_half)
            && bbox.overlaps_vertical(self.y_lo, self.y_hi)
    }
}

/// Largest accepted region; a candidate only replaces the current pick when
/// strictly larger, so ties keep the earlier region.
pub(crate) fn select_candidate(
    regions: &[Region],
    geometry: &DetectionGeometry,
) -> Option<BoundingBox> {
    let mut best: Option<BoundingBox> = None;
    for region in regions {
        let bbox = region.bbox;
        if !geometry.accepts(&bbox) {
            continue;
        }
        if best.is_none_or(|current| bbox.area() > current.area()) {
            best = Some(bbox);
        }
    }
    best
}

/// Side of the line a tracked box has fully committed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LineSide {
    Left,
    Right,
}

/// `Right` once the trailing (left) edge is at or past the line, `Left` once
/// the leading (right) edge is at or before it, `None` while straddling.
pub(crate) fn committed_side(bbox: &BoundingBox, line_x: f32) -> Option<LineSide> {
    if bbox.x as f32 >= line_x {
        Some(LineSide::Right)
    } else if bbox.right() as f32 <= line_x {
        Some(LineSide::Left)
    } else {
        None
    }
}

/// Advance the committed side with the latest tracked box.
///
/// A crossing fires only when the box commits to the side opposite the one it
/// was last committed to (or to any side when it has not committed yet).
/// Straddling keeps the previous side, so a box jittering across the line
/// without fully returning cannot fire twice.
pub(crate) fn detect_crossing(
    committed: Option<LineSide>,
    current: &BoundingBox,
    line_x: f32,
) -> (Option<LineSide>, Option<CrossingDirection>) {
    match committed_side(current, line_x) {
        Some(side) if committed != Some(side) => {
            let direction = match side {
                LineSide::Right => CrossingDirection::Right,
                LineSide::Left => CrossingDirection::Left,
            };
            (Some(side), Some(direction))
        }
        Some(_) | None => (committed, None),
    }
}

/// Whether the box centre has reached the outer `margin` fraction of the frame.
pub(crate) fn leaves_frame(bbox: &BoundingBox, width: u32, height: u32, margin: f32) -> bool {
    let (cx, cy) = bbox.center();
    let (mx, my) = (margin * width as f32, margin * height as f32);
    cx < mx || cy < my || cx > width as f32 - mx || cy > height as f32 - my
}
