//! Coordinate normalization of parsed paths
//!
//! After parsing, every coordinate of a feature goes through the same steps in a fixed
//! order: antimeridian unwrapping (optional), bounding box accumulation, capture of the
//! segment's reference origin, and downscaling to the working resolution.

use crate::geometry::DrawOp;

/// Width of the world in full-resolution tile space
pub const WORLD_SIZE: i64 = 1 << 32;

/// Mask bringing a coordinate back into the addressable `[0, 2^32)` range
const WORLD_MASK: i64 = WORLD_SIZE - 1;

/// Origin used when the first coordinate of a segment is off the plane
pub const UNKNOWN_ORIGIN: i64 = 1 << 31;

/// Axis-aligned bounding box in tile space
///
/// Starts out inverted (`min = i64::MAX`, `max = i64::MIN`) so that the first extended
/// coordinate becomes both corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingBox {
    pub const EMPTY: BoundingBox = BoundingBox {
        min_x: i64::MAX,
        min_y: i64::MAX,
        max_x: i64::MIN,
        max_y: i64::MIN,
    };

    /// True if no coordinate was ever added
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// True if max < min on either axis
    #[inline]
    pub fn is_inverted(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y
    }

    #[inline]
    pub fn extend(&mut self, x: i64, y: i64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    /// Grow to include `other`
    pub fn union(&mut self, other: &BoundingBox) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Horizontal extent, zero for an empty or inverted box
    #[inline]
    pub fn span_x(&self) -> i64 {
        if self.is_inverted() {
            0
        } else {
            self.max_x.saturating_sub(self.min_x)
        }
    }

    /// Vertical extent, zero for an empty or inverted box
    #[inline]
    pub fn span_y(&self) -> i64 {
        if self.is_inverted() {
            0
        } else {
            self.max_y.saturating_sub(self.min_y)
        }
    }

    /// Center of the box, masked into the addressable range even if off the plane
    pub fn midpoint(&self) -> (u32, u32) {
        let mid_x = (self.min_x / 2 + self.max_x / 2) & WORLD_MASK;
        let mid_y = (self.min_y / 2 + self.max_y / 2) & WORLD_MASK;
        (mid_x as u32, mid_y as u32)
    }
}

/// Reference point of a segment used for delta encoding of every feature it contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Origin {
    pub x: i64,
    pub y: i64,
}

impl Origin {
    /// Origin derived from the first full-resolution coordinate of a segment
    pub fn capture(x: i64, y: i64, geometry_scale: u32) -> Self {
        if !(0..WORLD_SIZE).contains(&x) || !(0..WORLD_SIZE).contains(&y) {
            Self {
                x: UNKNOWN_ORIGIN,
                y: UNKNOWN_ORIGIN,
            }
        } else {
            Self {
                x: (x >> geometry_scale) << geometry_scale,
                y: (y >> geometry_scale) << geometry_scale,
            }
        }
    }

    /// The origin in downscaled units
    pub fn scaled(&self, geometry_scale: u32) -> (i64, i64) {
        (self.x >> geometry_scale, self.y >> geometry_scale)
    }
}

/// Antimeridian tracking state of one feature
#[derive(Debug, Clone, Copy, Default)]
struct Wraparound {
    prev: i64,
    offset: i64,
    has_prev: bool,
}

impl Wraparound {
    /// Shift `x` by whole worlds so that it stays continuous with the previous point
    fn unwrap(&mut self, x: i64, jump_threshold: i64) -> i64 {
        let mut x = x + self.offset;

        if self.has_prev {
            if x - self.prev > jump_threshold {
                self.offset -= WORLD_SIZE;
                x -= WORLD_SIZE;
            } else if self.prev - x > jump_threshold {
                self.offset += WORLD_SIZE;
                x += WORLD_SIZE;
            }
        }

        self.has_prev = true;
        self.prev = x;
        x
    }
}

/// Per-feature coordinate post-processing
///
/// Create one per feature; the bounding box and wraparound state are discarded with it.
#[derive(Debug, Clone)]
pub struct CoordinateNormalizer {
    detect_wraparound: bool,
    jump_threshold: i64,
    geometry_scale: u32,
    wraparound: Wraparound,
    bbox: BoundingBox,
}

impl CoordinateNormalizer {
    pub fn new(detect_wraparound: bool, jump_threshold: i64, geometry_scale: u32) -> Self {
        Self {
            detect_wraparound,
            jump_threshold,
            geometry_scale,
            wraparound: Wraparound::default(),
            bbox: BoundingBox::EMPTY,
        }
    }

    /// Normalize a raw path in place
    ///
    /// `origin` is the segment's reference origin; it is captured from the first
    /// coordinate seen if it is not set yet.
    pub fn normalize(&mut self, geom: &mut [DrawOp], origin: &mut Option<Origin>) {
        for d in geom.iter_mut().filter(|d| d.is_point()) {
            let mut x = d.x;
            let y = d.y;

            if self.detect_wraparound {
                x = self.wraparound.unwrap(x, self.jump_threshold);
            }

            self.bbox.extend(x, y);

            if origin.is_none() {
                *origin = Some(Origin::capture(x, y, self.geometry_scale));
            }

            d.x = x >> self.geometry_scale;
            d.y = y >> self.geometry_scale;
        }
    }

    /// Bounding box of everything normalized so far, in full-resolution units
    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Op;
    use crate::projection::lonlat_to_tile;
    use proptest::prelude::*;

    fn path(points: &[(i64, i64)]) -> Vec<DrawOp> {
        points
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| DrawOp::new(if i == 0 { Op::MoveTo } else { Op::LineTo }, x, y))
            .collect()
    }

    #[test]
    fn test_antimeridian_crossing_stays_continuous() {
        let (x1, y1) = lonlat_to_tile(179.0, 0.0, 32);
        let (x2, y2) = lonlat_to_tile(-179.0, 0.0, 32);
        let mut geom = path(&[(x1, y1), (x2, y2)]);

        let mut normalizer = CoordinateNormalizer::new(true, 1 << 31, 0);
        let mut origin = None;
        normalizer.normalize(&mut geom, &mut origin);

        let dx = geom[1].x - geom[0].x;
        // Two degrees of longitude eastward, not a jump back across the world
        assert!(dx > 0);
        assert!(dx < WORLD_SIZE / 100);
        assert!(normalizer.bbox().max_x > WORLD_SIZE);
    }

    #[test]
    fn test_antimeridian_without_detection_jumps() {
        let (x1, y1) = lonlat_to_tile(179.0, 0.0, 32);
        let (x2, y2) = lonlat_to_tile(-179.0, 0.0, 32);
        let mut geom = path(&[(x1, y1), (x2, y2)]);

        let mut normalizer = CoordinateNormalizer::new(false, 1 << 31, 0);
        normalizer.normalize(&mut geom, &mut None);
        assert!(geom[0].x - geom[1].x > WORLD_SIZE / 2);
    }

    #[test]
    fn test_westward_crossing() {
        let (x1, y1) = lonlat_to_tile(-179.0, 0.0, 32);
        let (x2, y2) = lonlat_to_tile(179.0, 0.0, 32);
        let mut geom = path(&[(x1, y1), (x2, y2)]);

        let mut normalizer = CoordinateNormalizer::new(true, 1 << 31, 0);
        normalizer.normalize(&mut geom, &mut None);
        let dx = geom[1].x - geom[0].x;
        assert!(dx < 0);
        assert!(dx > -WORLD_SIZE / 100);
        assert!(normalizer.bbox().min_x < 0);
    }

    #[test]
    fn test_downscale_and_closepath_untouched() {
        let mut geom = vec![
            DrawOp::new(Op::MoveTo, 1024, 2048),
            DrawOp::new(Op::LineTo, 1031, 2055),
            DrawOp::close_path(),
        ];
        let mut normalizer = CoordinateNormalizer::new(false, 1 << 31, 3);
        normalizer.normalize(&mut geom, &mut None);

        assert_eq!((geom[0].x, geom[0].y), (128, 256));
        assert_eq!((geom[1].x, geom[1].y), (128, 256));
        assert_eq!(geom[2], DrawOp::close_path());

        // Bounding box keeps full resolution
        let bbox = normalizer.bbox();
        assert_eq!((bbox.min_x, bbox.max_x), (1024, 1031));
    }

    #[test]
    fn test_origin_captured_once() {
        let mut origin = None;
        let mut first = path(&[(1000, 2000)]);
        CoordinateNormalizer::new(false, 1 << 31, 4).normalize(&mut first, &mut origin);
        assert_eq!(origin, Some(Origin { x: 992, y: 2000 }));

        let mut second = path(&[(5000, 6000)]);
        CoordinateNormalizer::new(false, 1 << 31, 4).normalize(&mut second, &mut origin);
        assert_eq!(origin, Some(Origin { x: 992, y: 2000 }));
    }

    #[test]
    fn test_origin_off_plane_uses_sentinel() {
        assert_eq!(
            Origin::capture(-5, 100, 2),
            Origin {
                x: UNKNOWN_ORIGIN,
                y: UNKNOWN_ORIGIN
            }
        );
        assert_eq!(
            Origin::capture(100, WORLD_SIZE, 2),
            Origin {
                x: UNKNOWN_ORIGIN,
                y: UNKNOWN_ORIGIN
            }
        );
    }

    #[test]
    fn test_empty_bbox() {
        let mut normalizer = CoordinateNormalizer::new(true, 1 << 31, 0);
        let mut geom = vec![DrawOp::close_path()];
        normalizer.normalize(&mut geom, &mut None);
        assert!(normalizer.bbox().is_empty());
        assert_eq!(normalizer.bbox().span_x(), 0);
        assert_eq!(normalizer.bbox().span_y(), 0);
    }

    #[test]
    fn test_midpoint_masks_off_plane() {
        let bbox = BoundingBox {
            min_x: WORLD_SIZE + 10,
            min_y: 0,
            max_x: WORLD_SIZE + 20,
            max_y: 10,
        };
        assert_eq!(bbox.midpoint(), (15, 5));
    }

    proptest! {
        #[test]
        fn prop_bbox_contains_every_point(points in prop::collection::vec((-(1i64 << 33)..(1i64 << 33), -(1i64 << 33)..(1i64 << 33)), 1..50)) {
            let mut geom = path(&points);
            let mut normalizer = CoordinateNormalizer::new(true, 1 << 31, 0);
            normalizer.normalize(&mut geom, &mut None);
            let bbox = normalizer.bbox();

            prop_assert!(bbox.min_x <= bbox.max_x);
            prop_assert!(bbox.min_y <= bbox.max_y);
            for d in &geom {
                prop_assert!(bbox.min_x <= d.x && d.x <= bbox.max_x);
                prop_assert!(bbox.min_y <= d.y && d.y <= bbox.max_y);
            }
        }
    }
}
