//! GeoJSON Ingest Library - Feature ingestion for tile building
//!
//! This library turns a stream of GeoJSON values into the intermediate representation
//! consumed by a tile-building stage: an append-only stream of serialized feature records,
//! a metadata stream for features whose attributes are shared out of line, a fixed-size
//! index stream used for spatial sorting, and a deduplicated pool of attribute strings.
//!
//! # Architecture
//!
//! - **[`attribute`]**: Typing and stringification of attribute values
//! - **[`MetadataPool`]**: Content-addressed interning of `(type, text)` pairs
//! - **[`geometry`]**: Recursive coordinate parsing into [`DrawOp`] paths
//! - **[`CoordinateNormalizer`]**: Antimeridian unwrapping, bounding boxes and downscaling
//! - **[`FeatureRecordBuilder`]**: Assembly and serialization of one [`FeatureRecord`]
//! - **[`IngestRun`]**: Classification of JSON values and parallel per-segment ingestion
//!
//! # Performance Characteristics
//!
//! - **Parsing**: O(N) in input bytes per segment, segments are processed in parallel
//! - **Pool**: O(1) expected per interned value, one mutex shared by all segments
//! - **Memory**: per segment, the feature being read and the containers enclosing it,
//!   plus the pool

pub mod attribute;
mod config;
pub mod diagnostics;
mod feature;
pub mod geometry;
mod ingest;
mod layer;
mod normalize;
mod pool;
pub mod projection;
pub mod reader;
pub mod serial;

// Public API exports
pub use attribute::{Attribute, AttributeType, AttributeValue, ForcedType, parse_forced_type};
pub use config::{Config, IndexKeyPolicy};
pub use diagnostics::{Diagnostics, Warning};
pub use feature::{
    DistanceStats, FeatureRecord, FeatureRecordBuilder, FeatureSource, MetadataPlacement,
    TippecanoeOverrides, spatial_key,
};
pub use geometry::{DrawOp, FeatureType, GeometryKind, Op};
pub use ingest::{
    DriverState, IngestRun, IngestionDriver, InputNotice, RunSummary, SegmentContext, SegmentSummary,
    SegmentTask,
};
pub use layer::{AttributeStats, LayerEntry, LayerMap};
pub use normalize::{BoundingBox, CoordinateNormalizer, Origin};
pub use pool::{MetadataPool, PoolRef, resolve_in};
pub use projection::Projection;
pub use reader::{Container, StreamEnd, stream_objects};
pub use serial::{IndexEntry, SegmentOutput};

/// Error types for feature ingestion
///
/// Every variant is fatal for the run. Problems confined to a single feature
/// (malformed coordinates, missing geometry, unusable ids) are logged and skipped
/// instead of being returned.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{location}: {message}")]
    InvalidUtf8 { location: String, message: String },

    #[error("Unknown attribute type {0:?} (expected string, float, int or bool)")]
    UnknownAttributeType(String),

    #[error("Invalid attribute type specification {0:?} (expected key:type)")]
    InvalidAttributeSpec(String),

    #[error(
        "{location}: Large unclipped feature may be duplicated across {tiles} tiles, exceeding the limit of {limit}"
    )]
    UnclippedFeatureTooLarge {
        location: String,
        tiles: i64,
        limit: i64,
    },

    #[error("Unknown projection {0:?}")]
    UnknownProjection(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt intermediate stream: {0}")]
    CorruptStream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
