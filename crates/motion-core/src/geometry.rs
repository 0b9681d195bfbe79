use opencv::core::Rect;

/// Axis-aligned box in sub-frame pixel coordinates.
///
/// Width and height are always non-zero; use `Option<BoundingBox>` for
/// "no detection".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    /// True when `[x, right)` overlaps the closed span `[lo, hi]`.
    pub fn overlaps_horizontal(&self, lo: f32, hi: f32) -> bool {
        (self.x as f32) <= hi && (self.right() as f32) > lo
    }

    /// True when `[y, bottom)` overlaps the closed span `[lo, hi]`.
    pub fn overlaps_vertical(&self, lo: f32, hi: f32) -> bool {
        (self.y as f32) <= hi && (self.bottom() as f32) > lo
    }

    /// Whether the box lies entirely inside a `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }

    /// Intersect an OpenCV rectangle with a `width` x `height` frame.
    ///
    /// `None` when nothing of it remains inside the frame.
    pub fn from_rect_clipped(rect: Rect, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (i64::from(width), i64::from(height));
        let x0 = i64::from(rect.x).clamp(0, w);
        let y0 = i64::from(rect.y).clamp(0, h);
        let x1 = (i64::from(rect.x) + i64::from(rect.width)).clamp(0, w);
        let y1 = (i64::from(rect.y) + i64::from(rect.height)).clamp(0, h);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Self::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(
            self.x as i32,
            self.y as i32,
            self.width as i32,
            self.height as i32,
        )
    }

    /// Scale every coordinate by an integer factor (sub-frame → full frame).
    pub fn scaled(&self, factor: u32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}
