//! Projection of input coordinates into the fixed-point tile-space grid
//!
//! Tile space is a square grid `2^32` units wide covering the spherical Mercator plane,
//! with the origin at the north-west corner. Coordinates that fall outside the plane
//! are kept (possibly negative or beyond `2^32`) so that later stages can detect them.

use crate::{IngestError, Result};
use std::str::FromStr;

/// Number of bits of precision of full-resolution tile space
pub const WORLD_BITS: u32 = 32;

/// Latitude limit applied before projecting.
///
/// 89.9 degrees is well past the edge of the Mercator square but still finite,
/// so polar coordinates land off the plane instead of at infinity.
pub const MAX_LATITUDE: f64 = 89.9;

/// Longitude limit applied before projecting (one extra world on each side)
pub const MAX_LONGITUDE: f64 = 360.0;

/// Radius of the spherical Mercator Earth in meters (EPSG:3857)
pub const EARTH_RADIUS_M: f64 = 6378137.0;

/// Substitute used for non-finite EPSG:3857 input, safely off the plane
const OFF_PLANE_METERS: f64 = 40_000_000.0;

/// Supported input coordinate reference systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Projection {
    /// Longitude/latitude in degrees (WGS84)
    #[default]
    Epsg4326,
    /// Spherical Mercator meters
    Epsg3857,
}

impl Projection {
    /// Short name as accepted on the command line
    pub fn name(self) -> &'static str {
        match self {
            Projection::Epsg4326 => "EPSG:4326",
            Projection::Epsg3857 => "EPSG:3857",
        }
    }

    /// CRS URN expected in a FeatureCollection `crs` annotation for this projection
    pub fn alias(self) -> &'static str {
        match self {
            Projection::Epsg4326 => "urn:ogc:def:crs:OGC:1.3:CRS84",
            Projection::Epsg3857 => "urn:ogc:def:crs:EPSG::3857",
        }
    }

    /// Project an input coordinate pair into tile space with `zoom` bits of precision
    ///
    /// # Arguments
    /// * `ix` - Longitude (degrees) or easting (meters)
    /// * `iy` - Latitude (degrees) or northing (meters)
    /// * `zoom` - Bits of precision, 32 for full resolution
    #[inline]
    pub fn project(self, ix: f64, iy: f64, zoom: u32) -> (i64, i64) {
        match self {
            Projection::Epsg4326 => lonlat_to_tile(ix, iy, zoom),
            Projection::Epsg3857 => epsg3857_to_tile(ix, iy, zoom),
        }
    }
}

impl FromStr for Projection {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EPSG:4326" | "epsg:4326" | "4326" => Ok(Projection::Epsg4326),
            "EPSG:3857" | "epsg:3857" | "3857" => Ok(Projection::Epsg3857),
            other => Err(IngestError::UnknownProjection(other.to_string())),
        }
    }
}

/// Convert WGS84 (lon, lat) in degrees to spherical Mercator tile space
#[inline]
pub fn lonlat_to_tile(lon: f64, lat: f64, zoom: u32) -> (i64, i64) {
    // Non-finite input goes off the edge of the plane
    let lat = if lat.is_finite() { lat } else { MAX_LATITUDE };
    let lon = if lon.is_finite() { lon } else { MAX_LONGITUDE };

    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let lon = lon.clamp(-MAX_LONGITUDE, MAX_LONGITUDE);

    let lat_rad = lat.to_radians();
    let n = (1u64 << zoom) as f64;

    let x = n * ((lon + 180.0) / 360.0);
    let y = n * (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0;

    (x as i64, y as i64)
}

/// Convert spherical Mercator meters to tile space
#[inline]
pub fn epsg3857_to_tile(ix: f64, iy: f64, zoom: u32) -> (i64, i64) {
    let ix = if ix.is_finite() { ix } else { OFF_PLANE_METERS };
    let iy = if iy.is_finite() { iy } else { OFF_PLANE_METERS };

    let half = (1i64 << 31) as f64;
    let x = (ix * half / EARTH_RADIUS_M / std::f64::consts::PI + half) as i64;
    let y = (((1i64 << 32) - 1) as f64 - (iy * half / EARTH_RADIUS_M / std::f64::consts::PI + half))
        as i64;

    if zoom != 0 && zoom < WORLD_BITS {
        (x >> (WORLD_BITS - zoom), y >> (WORLD_BITS - zoom))
    } else {
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lonlat_origin_is_world_center() {
        let (x, y) = lonlat_to_tile(0.0, 0.0, 32);
        assert_eq!(x, 1i64 << 31);
        assert!((y - (1i64 << 31)).abs() <= 1);
    }

    #[test]
    fn test_lonlat_bounds() {
        let (west, _) = lonlat_to_tile(-180.0, 0.0, 32);
        assert_eq!(west, 0);

        let (east, _) = lonlat_to_tile(180.0, 0.0, 32);
        assert_eq!(east, 1i64 << 32);

        // North is up, so northern latitudes have smaller y
        let (_, north) = lonlat_to_tile(0.0, 60.0, 32);
        let (_, south) = lonlat_to_tile(0.0, -60.0, 32);
        assert!(north < south);
    }

    #[test]
    fn test_lonlat_non_finite_goes_off_plane() {
        let (x, y) = lonlat_to_tile(f64::NAN, f64::INFINITY, 32);
        assert!(x > 1i64 << 32);
        assert!(y < 0);
    }

    #[test]
    fn test_zoom_scales_output() {
        let (x, y) = lonlat_to_tile(90.0, 0.0, 2);
        assert_eq!(x, 3);
        assert_eq!(y, 2);
    }

    #[test]
    fn test_epsg3857_matches_lonlat_at_equator() {
        let meters = EARTH_RADIUS_M * std::f64::consts::PI / 2.0; // 90 degrees east
        let (x, _) = epsg3857_to_tile(meters, 0.0, 32);
        let (expected, _) = lonlat_to_tile(90.0, 0.0, 32);
        assert!((x - expected).abs() <= 1);
    }

    #[test]
    fn test_projection_parse() {
        assert_eq!(
            "EPSG:3857".parse::<Projection>().unwrap(),
            Projection::Epsg3857
        );
        assert_eq!(
            "EPSG:4326".parse::<Projection>().unwrap(),
            Projection::Epsg4326
        );
        assert!("EPSG:27700".parse::<Projection>().is_err());
    }
}
