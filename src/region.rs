//! Rectangle and region math for damage, opaque and input regions
//!
//! Regions are kept as lists of pairwise disjoint rectangles so that area
//! queries are exact. Damage regions can additionally be coalesced into a
//! single bounding box once they grow past a rectangle budget.
//!
//! # Example
//!
//! ```
//! use wally::region::{Rect, Region};
//!
//! let mut damage = Region::new();
//! damage.add(Rect::new(0, 0, 10, 10));
//! damage.add(Rect::new(5, 5, 10, 10));
//!
//! // Overlap is only counted once
//! assert_eq!(damage.area(), 175);
//! assert!(damage.contains_point(12, 12));
//! ```

/// Maximum number of damage rectangles per surface before coalescing to a bounding box
pub const MAX_DAMAGE_RECTS: usize = 16;

/// An axis-aligned rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// X coordinate (pixels)
    pub x: i32,
    /// Y coordinate (pixels)
    pub y: i32,
    /// Width (pixels)
    pub width: u32,
    /// Height (pixels)
    pub height: u32,
}

impl Rect {
    /// Creates a new rectangle
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Creates a rectangle from protocol arguments, where negative extents mean "empty"
    pub fn from_wire(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, width.max(0) as u32, height.max(0) as u32)
    }

    /// Creates a rectangle spanning two corners, in any order
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: x1.abs_diff(x2),
            height: y1.abs_diff(y2),
        }
    }

    fn right(&self) -> i32 {
        clamp_coord(i64::from(self.x) + i64::from(self.width))
    }

    fn bottom(&self) -> i32 {
        clamp_coord(i64::from(self.y) + i64::from(self.height))
    }

    /// Returns the area of this rectangle in pixels
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the rectangle covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Checks if this rectangle shares any pixels with another
    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.is_empty()
            || other.is_empty()
            || self.right() <= other.x
            || other.right() <= self.x
            || self.bottom() <= other.y
            || other.bottom() <= self.y)
    }

    /// Smallest rectangle containing both
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Computes the intersection of two rectangles
    ///
    /// Returns `None` if the rectangles don't intersect.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.intersects(other) {
            return None;
        }

        Some(Rect::from_corners(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        ))
    }

    /// Checks if this rectangle contains a point
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Checks if this rectangle completely contains another
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Moves the rectangle by an offset, saturating at the coordinate limits
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.width,
            self.height,
        )
    }

    /// Returns the parts of `self` not covered by `other` (at most four pieces)
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(cut) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut pieces = Vec::with_capacity(4);
        // Band above the cut
        if cut.y > self.y {
            pieces.push(Rect::from_corners(self.x, self.y, self.right(), cut.y));
        }
        // Band below the cut
        if cut.bottom() < self.bottom() {
            pieces.push(Rect::from_corners(self.x, cut.bottom(), self.right(), self.bottom()));
        }
        // Left and right of the cut, within its rows
        if cut.x > self.x {
            pieces.push(Rect::from_corners(self.x, cut.y, cut.x, cut.bottom()));
        }
        if cut.right() < self.right() {
            pieces.push(Rect::from_corners(cut.right(), cut.y, self.right(), cut.bottom()));
        }
        pieces
    }

    /// Converts a rectangle in buffer coordinates into surface-local coordinates
    ///
    /// `buffer_size` is the size of the attached buffer in buffer pixels.
    pub fn buffer_to_surface(
        &self,
        buffer_size: (u32, u32),
        transform: Transform,
        scale: i32,
    ) -> Rect {
        let scale = i64::from(scale.max(1));
        let (bw, bh) = (i64::from(buffer_size.0) / scale, i64::from(buffer_size.1) / scale);
        let (sw, sh) = if transform.swaps_axes() { (bh, bw) } else { (bw, bh) };

        let x1 = i64::from(self.x).div_euclid(scale);
        let y1 = i64::from(self.y).div_euclid(scale);
        let x2 = (i64::from(self.x) + i64::from(self.width) + scale - 1).div_euclid(scale);
        let y2 = (i64::from(self.y) + i64::from(self.height) + scale - 1).div_euclid(scale);

        let map = |bx: i64, by: i64| -> (i32, i32) {
            let (x, y) = match transform {
                Transform::Normal => (bx, by),
                Transform::Rotate90 => (by, sh - bx),
                Transform::Rotate180 => (sw - bx, sh - by),
                Transform::Rotate270 => (sw - by, bx),
                Transform::Flipped => (sw - bx, by),
                Transform::Flipped90 => (sw - by, sh - bx),
                Transform::Flipped180 => (bx, sh - by),
                Transform::Flipped270 => (by, bx),
            };
            (clamp_coord(x), clamp_coord(y))
        };

        let (ax, ay) = map(x1, y1);
        let (bx, by) = map(x2, y2);
        Rect::from_corners(ax, ay, bx, by)
    }
}

fn clamp_coord(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Buffer transform, matching the eight `wl_output.transform` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    /// Decodes a wire value, returning `None` for out-of-range values
    pub fn from_wire(value: i32) -> Option<Self> {
        Some(match value {
            0 => Transform::Normal,
            1 => Transform::Rotate90,
            2 => Transform::Rotate180,
            3 => Transform::Rotate270,
            4 => Transform::Flipped,
            5 => Transform::Flipped90,
            6 => Transform::Flipped180,
            7 => Transform::Flipped270,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Transform::Normal => 0,
            Transform::Rotate90 => 1,
            Transform::Rotate180 => 2,
            Transform::Rotate270 => 3,
            Transform::Flipped => 4,
            Transform::Flipped90 => 5,
            Transform::Flipped180 => 6,
            Transform::Flipped270 => 7,
        }
    }

    /// Whether width and height trade places under this transform
    pub fn swaps_axes(self) -> bool {
        matches!(
            self,
            Transform::Rotate90 | Transform::Rotate270 | Transform::Flipped90 | Transform::Flipped270
        )
    }
}

/// A set of pixels described by disjoint rectangles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// Creates an empty region
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    /// Creates a region covering a single rectangle
    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    /// Adds a rectangle; pixels already covered are not duplicated
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces.iter().flat_map(|p| p.subtract(existing)).collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    /// Removes a rectangle from the region
    pub fn subtract(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.rects = self.rects.iter().flat_map(|r| r.subtract(&rect)).collect();
    }

    /// Adds every rectangle of another region
    pub fn union_with(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add(*rect);
        }
    }

    /// Collapses the region to its bounding box once it exceeds `max_rects`
    ///
    /// Only meaningful for damage, where over-approximation is harmless.
    pub fn coalesce(&mut self, max_rects: usize) {
        if self.rects.len() > max_rects {
            if let Some(bounds) = self.bounding_box() {
                self.rects = vec![bounds];
            }
        }
    }

    /// Smallest rectangle containing the whole region
    pub fn bounding_box(&self) -> Option<Rect> {
        self.rects.iter().copied().reduce(|a, b| a.union(&b))
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Exact covered area in pixels
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    /// Whether every pixel of `rect` is in the region
    pub fn contains_rect(&self, rect: &Rect) -> bool {
        let mut remaining = vec![*rect];
        for r in &self.rects {
            remaining = remaining.iter().flat_map(|p| p.subtract(r)).collect();
            if remaining.is_empty() {
                return true;
            }
        }
        remaining.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}
