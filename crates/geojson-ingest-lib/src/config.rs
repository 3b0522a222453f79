//! Run configuration
//!
//! A [`Config`] is built once before ingestion starts and shared read-only by every
//! segment.

use crate::attribute::ForcedType;
use crate::projection::{Projection, WORLD_BITS};
use crate::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Downstream features that need the spatial key stored in each record
///
/// The index stream always carries the key; the record only does when one of these
/// is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKeyPolicy {
    pub drop_densest_as_needed: bool,
    pub calculate_feature_density: bool,
    pub increase_gamma_as_needed: bool,
    /// A nonzero gamma was configured
    pub uses_gamma: bool,
}

impl IndexKeyPolicy {
    /// Whether records must carry their spatial key
    pub fn stores_key(&self) -> bool {
        self.drop_densest_as_needed
            || self.calculate_feature_density
            || self.increase_gamma_as_needed
            || self.uses_gamma
    }
}

/// Configuration of an ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Highest zoom level the output will be built for.
    /// Decides inline vs. external metadata and the unclipped-feature estimate.
    /// Default: 14
    pub maxzoom: u32,
    /// Number of low bits dropped from full-resolution coordinates before encoding.
    /// Default: 6 (maxzoom 14 with 12 bits of detail), see [`Config::geometry_scale_for`]
    pub geometry_scale: u32,
    /// Projection of input coordinates
    pub projection: Projection,
    /// Keep longitudes continuous across the antimeridian within a feature
    pub detect_wraparound: bool,
    /// Features will not be clipped at tile boundaries downstream
    pub prevent_clipping: bool,
    /// Store each record's input sequence number so input order can be restored
    pub preserve_input_order: bool,
    /// Compute each feature's extent (area or length) for smallest-first dropping
    pub drop_smallest_as_needed: bool,
    pub index_key: IndexKeyPolicy,
    /// Accumulate the log-mean spacing between features' spatial keys
    pub want_distance_stats: bool,
    /// Attribute keys to drop
    pub exclude: BTreeSet<String>,
    /// Drop every attribute except those in `include`
    pub exclude_all: bool,
    pub include: BTreeSet<String>,
    /// Per-key forced attribute types
    pub attribute_types: BTreeMap<String, ForcedType>,
    /// Tile replication estimate above which an unclipped feature is fatal.
    /// Default: 10000
    pub unclipped_tile_limit: i64,
    /// Longitude jump, in full-resolution units, treated as an antimeridian crossing.
    /// Default: 2^31 (half the world)
    pub antimeridian_jump: i64,
    /// Features between progress reports, counted over all segments.
    /// Default: 10000
    pub progress_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maxzoom: 14,
            geometry_scale: Self::geometry_scale_for(14, 12),
            projection: Projection::default(),
            detect_wraparound: false,
            prevent_clipping: false,
            preserve_input_order: false,
            drop_smallest_as_needed: false,
            index_key: IndexKeyPolicy::default(),
            want_distance_stats: false,
            exclude: BTreeSet::new(),
            exclude_all: false,
            include: BTreeSet::new(),
            attribute_types: BTreeMap::new(),
            unclipped_tile_limit: 10_000,
            antimeridian_jump: 1 << 31,
            progress_interval: 10_000,
        }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Config {
    /// Geometry scale that keeps `full_detail` bits of precision at `maxzoom`
    pub fn geometry_scale_for(maxzoom: u32, full_detail: u32) -> u32 {
        WORLD_BITS.saturating_sub(maxzoom + full_detail)
    }

    /// Check that the settings are usable together
    pub fn validate(&self) -> Result<()> {
        if self.maxzoom > WORLD_BITS {
            return Err(IngestError::InvalidConfig(format!(
                "maxzoom {} is beyond the {WORLD_BITS}-bit coordinate space",
                self.maxzoom
            )));
        }
        if self.geometry_scale >= WORLD_BITS {
            return Err(IngestError::InvalidConfig(format!(
                "geometry scale {} leaves no coordinate precision",
                self.geometry_scale
            )));
        }
        if self.antimeridian_jump <= 0 {
            return Err(IngestError::InvalidConfig(
                "antimeridian jump threshold must be positive".to_string(),
            ));
        }
        if self.progress_interval == 0 {
            return Err(IngestError::InvalidConfig(
                "progress interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether attributes with this key are kept
    pub fn keeps_attribute(&self, key: &str) -> bool {
        if self.exclude_all {
            self.include.contains(key)
        } else {
            !self.exclude.contains(key)
        }
    }

    /// Bounding-box span above which attributes are stored out of line
    pub fn external_metadata_span(&self) -> i64 {
        2i64 << (WORLD_BITS - self.maxzoom)
    }

    /// Size of a tile at `maxzoom` in full-resolution units
    pub fn maxzoom_tile_size(&self) -> i64 {
        1i64 << (WORLD_BITS - self.maxzoom)
    }
}
