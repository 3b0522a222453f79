//! Geometry parsing into flat drawing-op paths
//!
//! GeoJSON coordinates are nested arrays whose depth depends on the geometry kind.
//! Parsing walks them recursively following the containment table of the kinds and
//! emits one [`DrawOp`] per coordinate, projected into full-resolution tile space.

use crate::Projection;
use crate::diagnostics::{self, Diagnostics, Warning};
use geo::{Area, Coord, LineString, Polygon};
use serde_json::Value;

/// Drawing operation of a path element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Start of a new part or ring
    MoveTo,
    /// Continuation of the current part or ring
    LineTo,
    /// End of a Polygon within a raw (unfixed) path. Carries no coordinate.
    ClosePath,
}

impl Op {
    /// Wire code used in the geometry stream
    pub fn code(self) -> u8 {
        match self {
            Op::MoveTo => 1,
            Op::LineTo => 2,
            Op::ClosePath => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Op::MoveTo),
            2 => Some(Op::LineTo),
            7 => Some(Op::ClosePath),
            _ => None,
        }
    }
}

/// One element of a geometry path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawOp {
    pub op: Op,
    pub x: i64,
    pub y: i64,
}

impl DrawOp {
    pub fn new(op: Op, x: i64, y: i64) -> Self {
        Self { op, x, y }
    }

    pub fn close_path() -> Self {
        Self::new(Op::ClosePath, 0, 0)
    }

    /// Whether this op carries a coordinate
    #[inline]
    pub fn is_point(&self) -> bool {
        matches!(self.op, Op::MoveTo | Op::LineTo)
    }
}

/// Output feature type; multi-geometries collapse to their base type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum FeatureType {
    Point,
    Line,
    Polygon,
}

impl FeatureType {
    /// Wire code used in the geometry and index streams
    pub fn code(self) -> u8 {
        match self {
            FeatureType::Point => 1,
            FeatureType::Line => 2,
            FeatureType::Polygon => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FeatureType::Point),
            2 => Some(FeatureType::Line),
            3 => Some(FeatureType::Polygon),
            _ => None,
        }
    }
}

/// GeoJSON geometry kinds understood by the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
}

impl GeometryKind {
    pub const ALL: [GeometryKind; 6] = [
        GeometryKind::Point,
        GeometryKind::MultiPoint,
        GeometryKind::LineString,
        GeometryKind::MultiLineString,
        GeometryKind::Polygon,
        GeometryKind::MultiPolygon,
    ];

    /// GeoJSON `type` name
    pub fn name(self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::MultiPoint => "MultiPoint",
            GeometryKind::LineString => "LineString",
            GeometryKind::MultiLineString => "MultiLineString",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::MultiPolygon => "MultiPolygon",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Kind of the elements of this kind's coordinate array, `None` for a coordinate pair
    pub fn within(self) -> Option<GeometryKind> {
        match self {
            GeometryKind::Point => None,
            GeometryKind::MultiPoint | GeometryKind::LineString => Some(GeometryKind::Point),
            GeometryKind::MultiLineString | GeometryKind::Polygon => Some(GeometryKind::LineString),
            GeometryKind::MultiPolygon => Some(GeometryKind::Polygon),
        }
    }

    pub fn feature_type(self) -> FeatureType {
        match self {
            GeometryKind::Point | GeometryKind::MultiPoint => FeatureType::Point,
            GeometryKind::LineString | GeometryKind::MultiLineString => FeatureType::Line,
            GeometryKind::Polygon | GeometryKind::MultiPolygon => FeatureType::Polygon,
        }
    }
}

/// Nested coordinate structure that the parser can walk
///
/// Implemented for [`serde_json::Value`]; other tree representations only need to
/// expose their array children and numeric leaves.
pub trait CoordinateTree: Sized {
    /// Elements if this node is an array
    fn children(&self) -> Option<&[Self]>;
    /// Numeric value if this node is a number
    fn number(&self) -> Option<f64>;
    /// Short textual rendering for diagnostics
    fn context(&self) -> String;
}

impl CoordinateTree for Value {
    fn children(&self) -> Option<&[Value]> {
        self.as_array().map(Vec::as_slice)
    }

    fn number(&self) -> Option<f64> {
        self.as_f64()
    }

    fn context(&self) -> String {
        diagnostics::json_context(self)
    }
}

/// Per-feature inputs of the parser that do not change while recursing
pub struct ParseContext<'a, T> {
    pub projection: Projection,
    /// `source:line` of the value being parsed
    pub location: &'a str,
    /// Enclosing feature, for diagnostics
    pub feature: &'a T,
    pub diagnostics: &'a Diagnostics,
}

/// Parse the coordinates of a geometry of the given kind, appending to `out`
///
/// Malformed coordinates are reported and skipped, so the resulting path may be shorter
/// than the input. Each Polygon is terminated by a [`Op::ClosePath`] marker.
pub fn parse_geometry<T: CoordinateTree>(
    kind: GeometryKind,
    tree: &T,
    out: &mut Vec<DrawOp>,
    op: Op,
    ctx: &ParseContext<'_, T>,
) {
    let Some(children) = tree.children() else {
        tracing::warn!(
            "{}: expected array for {} in JSON object {}",
            ctx.location,
            kind.name(),
            ctx.feature.context()
        );
        return;
    };

    match kind.within() {
        Some(within) => {
            for (i, child) in children.iter().enumerate() {
                let op = if within == GeometryKind::Point {
                    if i == 0 || kind == GeometryKind::MultiPoint {
                        Op::MoveTo
                    } else {
                        Op::LineTo
                    }
                } else {
                    op
                };

                parse_geometry(within, child, out, op, ctx);
            }
        }
        None => match (
            children.first().and_then(T::number),
            children.get(1).and_then(T::number),
        ) {
            (Some(lon), Some(lat)) => {
                let (x, y) = ctx.projection.project(lon, lat, crate::projection::WORLD_BITS);

                if children.len() > 2 && ctx.diagnostics.first(Warning::ExtraDimensions) {
                    tracing::warn!(
                        "{}: ignoring dimensions beyond two in {} (in JSON object {})",
                        ctx.location,
                        tree.context(),
                        ctx.feature.context()
                    );
                }

                out.push(DrawOp::new(op, x, y));
            }
            _ => {
                tracing::warn!(
                    "{}: malformed point {} in JSON object {}",
                    ctx.location,
                    tree.context(),
                    ctx.feature.context()
                );
            }
        },
    }

    // A Polygon without rings leaves no trace in the path
    if kind == GeometryKind::Polygon && !children.is_empty() {
        out.push(DrawOp::close_path());
    }
}

/// Index one past the last op of the ring or part starting at `start`
pub fn part_end(geom: &[DrawOp], start: usize) -> usize {
    let mut end = start + 1;
    while end < geom.len() && geom[end].op == Op::LineTo {
        end += 1;
    }
    end
}

/// Signed shoelace area of a ring, positive for counter-clockwise in a y-up frame
pub fn ring_area(ring: &[DrawOp]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }

    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|d| Coord {
            x: d.x as f64,
            y: d.y as f64,
        })
        .collect();

    Polygon::new(LineString::new(coords), vec![]).signed_area()
}

/// Normalize the rings of a raw Polygon/MultiPolygon path
///
/// Within each ClosePath-delimited Polygon the first ring is outer and the rest are
/// holes. Rings are closed, outer rings get positive area and holes negative area, and
/// the ClosePath markers are removed.
pub fn fix_polygon(geom: &[DrawOp]) -> Vec<DrawOp> {
    let mut out = Vec::with_capacity(geom.len());
    let mut outer = true;
    let mut i = 0;

    while i < geom.len() {
        if geom[i].op == Op::ClosePath {
            outer = true;
            i += 1;
            continue;
        }

        // A ring whose first point was malformed starts with a LineTo; treat it as a start anyway
        let end = part_end(geom, i);
        let mut ring: Vec<DrawOp> = geom[i..end].to_vec();

        let (first, last) = (ring[0], ring[ring.len() - 1]);
        if first.x != last.x || first.y != last.y {
            ring.push(first);
        }

        if (ring_area(&ring) > 0.0) != outer {
            ring.reverse();
        }

        for (a, d) in ring.iter().enumerate() {
            let op = if a == 0 { Op::MoveTo } else { Op::LineTo };
            out.push(DrawOp::new(op, d.x, d.y));
        }

        outer = false;
        i = end;
    }

    out
}
