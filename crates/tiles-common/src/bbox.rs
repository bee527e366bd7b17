//! Bounding box types and overlap tests.

use serde::{Deserialize, Serialize};

/// A geographic or projected bounding box.
///
/// For geographic coordinates (EPSG:4326) the values are degrees; for
/// Web Mercator (EPSG:3857) they are meters. Overlap tests only require
/// both boxes to share a reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Create a new bounding box from corner coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Width of the bounding box in coordinate units.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height of the bounding box in coordinate units.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Check whether two boxes overlap.
    ///
    /// A box is disjoint from another iff it lies strictly north, east,
    /// south or west of it; anything else counts as overlapping, so boxes
    /// that merely touch are treated as inside.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        !(self.max_y < other.min_y
            || self.max_x < other.min_x
            || self.min_y > other.max_y
            || self.min_x > other.max_x)
    }

    /// Check whether this box collapses to a single point.
    ///
    /// Point extents come from single-row datasets; they must never
    /// short-circuit tile serving, so callers treat them as "always inside".
    pub fn is_degenerate(&self) -> bool {
        self.min_x == self.max_x && self.min_y == self.max_y
    }

    /// Return a copy padded outward by `pad` units on every side.
    pub fn padded(&self, pad: f64) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x - pad,
            min_y: self.min_y - pad,
            max_x: self.max_x + pad,
            max_y: self.max_y + pad,
        }
    }

    /// Grow this box to cover `other`.
    pub fn extend(&mut self, other: &BoundingBox) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Check if a point is contained within this bbox.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}
