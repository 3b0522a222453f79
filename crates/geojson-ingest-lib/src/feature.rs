//! Assembly of feature records
//!
//! [`FeatureRecordBuilder`] takes one geometry together with the properties, id and
//! `tippecanoe` overrides of the feature it belongs to, and turns it into a
//! [`FeatureRecord`] appended to the segment's streams. Along the way it updates the
//! layer registry, the metadata pool and the segment's aggregates.

use crate::attribute::{Attribute, encode_attribute};
use crate::config::Config;
use crate::diagnostics::{Diagnostics, Warning, json_context};
use crate::geometry::{self, DrawOp, FeatureType, GeometryKind, Op, ParseContext};
use crate::ingest::SegmentContext;
use crate::layer::LayerMap;
use crate::normalize::{BoundingBox, CoordinateNormalizer};
use crate::pool::{MetadataPool, PoolRef};
use crate::serial::IndexEntry;
use crate::{IngestError, Result};
use serde_json::Value;
use smallvec::SmallVec;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Approximate conversion factor from tile units to feet, as a square root divisor
const TILE_UNITS_PER_FOOT: f64 = 33.0;

/// Where a record's attributes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataPlacement {
    /// Key/value pool references stored in the record itself
    Inline(SmallVec<[(PoolRef, PoolRef); 8]>),
    /// `count` reference pairs stored at `offset` of the segment's metadata stream
    External { offset: u64, count: usize },
}

impl MetadataPlacement {
    /// Whether a feature with this bounding box keeps its attributes out of line
    ///
    /// Features wider or taller than `span_limit` (two tiles at maxzoom, see
    /// [`Config::external_metadata_span`]) will be repeated in several tiles, so their
    /// attributes are written once to the metadata stream.
    pub fn is_external(bbox: &BoundingBox, span_limit: i64) -> bool {
        bbox.span_x() > span_limit || bbox.span_y() > span_limit
    }

    /// Offset into the metadata stream, or -1 for inline attributes
    pub fn metapos(&self) -> i64 {
        match self {
            MetadataPlacement::Inline(_) => -1,
            MetadataPlacement::External { offset, .. } => *offset as i64,
        }
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        match self {
            MetadataPlacement::Inline(pairs) => pairs.len(),
            MetadataPlacement::External { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One serialized feature of the geometry stream
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub feature_type: FeatureType,
    pub layer: usize,
    /// Input sequence number, 0 unless input order is preserved
    pub seq: i64,
    pub id: Option<u64>,
    pub minzoom: Option<i32>,
    pub maxzoom: Option<i32>,
    pub segment: u32,
    /// Downscaled, ring-fixed path
    pub geometry: Vec<DrawOp>,
    /// Spatial key, 0 unless a downstream consumer needs it
    pub index: u64,
    /// Area or length used for smallest-first dropping
    pub extent: i64,
    pub metadata: MetadataPlacement,
}

impl FeatureRecord {
    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }
}

/// Per-feature overrides from the `tippecanoe` member of a Feature
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TippecanoeOverrides {
    pub minzoom: Option<i32>,
    pub maxzoom: Option<i32>,
    pub layer: Option<String>,
}

impl TippecanoeOverrides {
    pub fn from_json(tippecanoe: Option<&Value>) -> Self {
        let Some(tippecanoe) = tippecanoe else {
            return Self::default();
        };

        let layer = match tippecanoe.get("layer") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Self {
            minzoom: zoom_override(tippecanoe.get("minzoom")),
            maxzoom: zoom_override(tippecanoe.get("maxzoom")),
            layer: layer.filter(|name| !name.is_empty()),
        }
    }
}

fn zoom_override(value: Option<&Value>) -> Option<i32> {
    let zoom = match value? {
        Value::Number(n) => n.as_f64().map(|z| z as i32),
        Value::String(s) => Some(leading_int(s)),
        _ => None,
    };
    // -1 means no override
    zoom.filter(|&z| z != -1)
}

/// Integer prefix of `text` after leading whitespace, saturating, 0 if there is none
fn leading_int(text: &str) -> i32 {
    let s = text.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| (acc * 10 + i64::from(d - b'0')).min(i64::from(i32::MAX) + 1));

    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// The parts of a Feature that one record is built from
///
/// A Feature whose geometry is a GeometryCollection produces one source per member
/// geometry, all sharing `properties`, `id` and `tippecanoe`.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSource<'a> {
    pub geometry: &'a Value,
    pub properties: Option<&'a Value>,
    pub id: Option<&'a Value>,
    pub tippecanoe: Option<&'a Value>,
    /// Enclosing Feature (or the bare geometry itself), for diagnostics
    pub feature: &'a Value,
    /// Input line the value was read at
    pub line: u64,
}

impl<'a> FeatureSource<'a> {
    /// A top-level geometry without properties
    pub fn bare(geometry: &'a Value, line: u64) -> Self {
        Self {
            geometry,
            properties: None,
            id: None,
            tippecanoe: None,
            feature: geometry,
            line,
        }
    }
}

/// Log-mean spacing between the points of features, in feet
///
/// Only an estimate used to suggest a zoom level; accumulated per segment and merged in
/// segment order.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DistanceStats {
    pub log_sum: f64,
    pub count: u64,
}

impl DistanceStats {
    /// Add the point spacing of one downscaled path
    pub fn sample(&mut self, geom: &[DrawOp], geometry_scale: u32) {
        let mut keys: Vec<u64> = geom
            .iter()
            .filter(|d| d.is_point())
            .map(|d| spatial_key((d.x << geometry_scale) as u32, (d.y << geometry_scale) as u32))
            .collect();
        keys.sort_unstable();

        let (sum, n) = keys
            .windows(2)
            .filter(|w| w[0] != w[1])
            .fold((0.0f64, 0u64), |(sum, n), w| (sum + ((w[1] - w[0]) as f64).ln(), n + 1));

        if n > 0 {
            let avg = (sum / n as f64).exp();
            let dist_ft = avg.sqrt() / TILE_UNITS_PER_FOOT;
            self.log_sum += dist_ft.ln() * n as f64;
            self.count += n;
        }
    }

    pub fn merge(&mut self, other: &DistanceStats) {
        self.log_sum += other.log_sum;
        self.count += other.count;
    }

    /// Geometric mean of the sampled spacings in feet
    pub fn mean_spacing_ft(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.log_sum / self.count as f64).exp())
    }
}

/// Z-order key interleaving the bits of `x` and `y`, x taking the higher bit of each pair
pub fn spatial_key(x: u32, y: u32) -> u64 {
    (0..32).fold(0u64, |key, i| {
        let bit = 31 - i;
        let pair = ((u64::from(x >> bit) & 1) << 1) | (u64::from(y >> bit) & 1);
        key | (pair << (2 * bit))
    })
}

/// Area of polygon rings or length of line parts of a downscaled path
pub fn feature_extent(feature_type: FeatureType, geom: &[DrawOp]) -> f64 {
    match feature_type {
        FeatureType::Point => 0.0,
        FeatureType::Polygon => {
            let mut extent = 0.0;
            let mut i = 0;
            while i < geom.len() {
                if geom[i].op == Op::MoveTo {
                    let end = geometry::part_end(geom, i);
                    extent += geometry::ring_area(&geom[i..end]);
                    i = end;
                } else {
                    i += 1;
                }
            }
            extent
        }
        FeatureType::Line => geom
            .windows(2)
            .filter(|w| w[1].op == Op::LineTo)
            .map(|w| ((w[1].x - w[0].x) as f64).hypot((w[1].y - w[0].y) as f64))
            .sum(),
    }
}

/// Validate a feature id, warning once per category about unusable ones
fn validate_id(id: &Value, diagnostics: &Diagnostics) -> Option<u64> {
    let Value::Number(n) = id else {
        if diagnostics.first(Warning::NonNumericId) {
            tracing::warn!("Can't represent non-numeric feature ID {id}");
        }
        return None;
    };

    let text = n.to_string();
    if text.starts_with('-') && n.as_f64().is_some_and(|v| v < 0.0) {
        if diagnostics.first(Warning::NegativeId) {
            tracing::warn!("Can't represent negative feature ID {text}");
        }
        return None;
    }

    // Negative values are gone, so a sign here belongs to a zero
    let digits = text.strip_prefix('-').unwrap_or(&text);
    if !digits.is_empty() && digits.bytes().all(|c| c.is_ascii_digit()) {
        // Out-of-range integers saturate
        return Some(digits.parse().unwrap_or(u64::MAX));
    }

    if diagnostics.first(Warning::FractionalId) {
        tracing::warn!("Can't represent non-integer feature ID {text}");
    }
    None
}

/// Builds and writes records for one run
///
/// Holds the run-wide shared state; the per-segment state is passed to
/// [`FeatureRecordBuilder::build`].
pub struct FeatureRecordBuilder<'r> {
    config: &'r Config,
    pool: &'r MetadataPool,
    layers: &'r LayerMap,
    diagnostics: &'r Diagnostics,
    /// Features written so far over all segments
    progress: &'r AtomicU64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<'r> FeatureRecordBuilder<'r> {
    pub fn new(
        config: &'r Config,
        pool: &'r MetadataPool,
        layers: &'r LayerMap,
        diagnostics: &'r Diagnostics,
        progress: &'r AtomicU64,
    ) -> Self {
        Self {
            config,
            pool,
            layers,
            diagnostics,
            progress,
        }
    }

    pub fn config(&self) -> &'r Config {
        self.config
    }

    /// Build the record for one geometry and append it to the segment's streams
    ///
    /// Returns `Ok(None)` if the geometry is unusable and was skipped. Errors are fatal
    /// for the run.
    pub fn build<W: Write>(
        &self,
        source: &FeatureSource<'_>,
        segment: &mut SegmentContext<W>,
    ) -> Result<Option<IndexEntry>> {
        let location = format!("{}:{}", segment.source, source.line);

        let Some(kind) = self.geometry_kind(source, &location) else {
            return Ok(None);
        };
        let Some(coordinates) = source.geometry.get("coordinates") else {
            return Ok(None);
        };
        let feature_type = kind.feature_type();

        let overrides = TippecanoeOverrides::from_json(source.tippecanoe);
        let id = source.id.and_then(|id| validate_id(id, self.diagnostics));

        let layer_name = overrides.layer.as_deref().unwrap_or(&segment.layer_name);
        let layer = self.layers.resolve(layer_name);
        self.layers.count_feature(layer_name, feature_type);

        let attributes = self.encode_properties(source, layer_name);

        // Geometry
        let mut geom = Vec::new();
        let ctx = ParseContext {
            projection: self.config.projection,
            location: &location,
            feature: source.feature,
            diagnostics: self.diagnostics,
        };
        geometry::parse_geometry(kind, coordinates, &mut geom, Op::MoveTo, &ctx);
        let has_points = geom.iter().any(DrawOp::is_point);

        let mut normalizer = CoordinateNormalizer::new(
            self.config.detect_wraparound,
            self.config.antimeridian_jump,
            self.config.geometry_scale,
        );
        normalizer.normalize(&mut geom, &mut segment.origin);
        let bbox = normalizer.bbox();

        if feature_type == FeatureType::Polygon {
            geom = geometry::fix_polygon(&geom);
        }

        if self.config.want_distance_stats {
            segment.distance.sample(&geom, self.config.geometry_scale);
        }

        if has_points && bbox.is_inverted() {
            tracing::error!(
                "Internal error: impossible feature bounding box {:x},{:x},{:x},{:x}",
                bbox.min_x,
                bbox.min_y,
                bbox.max_x,
                bbox.max_y
            );
        }

        let external = MetadataPlacement::is_external(&bbox, self.config.external_metadata_span());
        if external && self.config.prevent_clipping {
            self.check_unclipped(&bbox, &location)?;
        }

        let extent = if self.config.drop_smallest_as_needed {
            feature_extent(feature_type, &geom) as i64
        } else {
            0
        };

        let (mid_x, mid_y) = bbox.midpoint();
        let key = spatial_key(mid_x, mid_y);

        let pairs: SmallVec<[(PoolRef, PoolRef); 8]> = attributes
            .iter()
            .map(|a| (self.pool.intern_key(&a.key), self.pool.intern_value(&a.value)))
            .collect();
        let metadata = if external {
            let offset = segment.output.write_metadata(&pairs)?;
            MetadataPlacement::External {
                offset,
                count: pairs.len(),
            }
        } else {
            MetadataPlacement::Inline(pairs)
        };

        let record = FeatureRecord {
            feature_type,
            layer,
            seq: if self.config.preserve_input_order {
                segment.layer_seq
            } else {
                0
            },
            id,
            minzoom: overrides.minzoom,
            maxzoom: overrides.maxzoom,
            segment: segment.segment,
            geometry: geom,
            index: if self.config.index_key.stores_key() { key } else { 0 },
            extent,
            metadata,
        };

        let origin = segment
            .origin
            .map_or((0, 0), |origin| origin.scaled(self.config.geometry_scale));
        let (start, end) = segment.output.write_record(&record, origin)?;

        let entry = IndexEntry {
            start,
            end,
            key,
            seq: segment.layer_seq,
            segment: segment.segment,
            feature_type,
        };
        segment.output.write_index(&entry)?;

        segment.bbox.union(&bbox);
        segment.records += 1;
        segment.layer_seq += 1;

        let progress = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
        if progress % self.config.progress_interval == 0 {
            tracing::info!("Read {:.2} million features", progress as f64 / 1_000_000.0);
        }

        Ok(Some(entry))
    }

    /// Geometry kind of the source, logging why if there is none
    fn geometry_kind(&self, source: &FeatureSource<'_>, location: &str) -> Option<GeometryKind> {
        let Some(geometry_type) = source.geometry.get("type") else {
            if self.diagnostics.first(Warning::NullGeometry) {
                tracing::warn!(
                    "{location}: null geometry (additional not reported) in JSON object {}",
                    json_context(source.feature)
                );
            }
            return None;
        };

        let Some(type_name) = geometry_type.as_str() else {
            tracing::warn!(
                "{location}: geometry type is not a string in JSON object {}",
                json_context(source.feature)
            );
            return None;
        };

        if !source.geometry.get("coordinates").is_some_and(Value::is_array) {
            tracing::warn!(
                "{location}: feature without coordinates array in JSON object {}",
                json_context(source.feature)
            );
            return None;
        }

        let kind = GeometryKind::from_name(type_name);
        if kind.is_none() {
            tracing::warn!(
                "{location}: Can't handle geometry type {type_name} in JSON object {}",
                json_context(source.feature)
            );
        }
        kind
    }

    /// Filter, type and stringify the properties, recording them in the layer schema
    fn encode_properties(&self, source: &FeatureSource<'_>, layer_name: &str) -> Vec<Attribute> {
        let Some(properties) = source.properties.and_then(Value::as_object) else {
            return Vec::new();
        };

        let mut attributes = Vec::with_capacity(properties.len());
        for (key, value) in properties {
            if !self.config.keeps_attribute(key) {
                continue;
            }

            if let Some(encoded) = encode_attribute(key, value, &self.config.attribute_types) {
                self.layers.record_attribute_type(layer_name, key, &encoded);
                attributes.push(Attribute {
                    key: key.clone(),
                    value: encoded,
                });
            }
        }
        attributes
    }

    /// Abort on unclipped features that would be copied into too many tiles
    fn check_unclipped(&self, bbox: &BoundingBox, location: &str) -> Result<()> {
        let tile = self.config.maxzoom_tile_size() + 1;
        let tiles = (bbox.span_x() / tile).saturating_mul(bbox.span_y() / tile);

        if self.diagnostics.raise_unclipped_extent(tiles) {
            tracing::warn!("{location}: Large unclipped feature may be duplicated across {tiles} tiles");

            if tiles > self.config.unclipped_tile_limit {
                return Err(IngestError::UnclippedFeatureTooLarge {
                    location: location.to_string(),
                    tiles,
                    limit: self.config.unclipped_tile_limit,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeType, AttributeValue};
    use crate::pool::resolve_in;
    use crate::serial::{SegmentOutput, read_metadata, read_record};
    use serde_json::json;

    struct Harness {
        config: Config,
        pool: MetadataPool,
        layers: LayerMap,
        diagnostics: Diagnostics,
        progress: AtomicU64,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            Self {
                config,
                pool: MetadataPool::new(),
                layers: LayerMap::new(),
                diagnostics: Diagnostics::new(),
                progress: AtomicU64::new(0),
            }
        }

        fn builder(&self) -> FeatureRecordBuilder<'_> {
            FeatureRecordBuilder::new(&self.config, &self.pool, &self.layers, &self.diagnostics, &self.progress)
        }

        fn segment(&self) -> SegmentContext<Vec<u8>> {
            SegmentContext::new(0, "test.json", "default", SegmentOutput::in_memory())
        }
    }

    fn decode_only_record(segment: SegmentContext<Vec<u8>>, scale: u32) -> (FeatureRecord, Vec<u8>) {
        let origin = segment.origin.map_or((0, 0), |o| o.scaled(scale));
        let (geometry, metadata, _) = segment.output.into_inner();
        (read_record(&mut &geometry[..], origin).unwrap(), metadata)
    }

    #[test]
    fn test_spatial_key_interleaving() {
        assert_eq!(spatial_key(0, 0), 0);
        assert_eq!(spatial_key(1, 0), 0b10);
        assert_eq!(spatial_key(0, 1), 0b01);
        assert_eq!(spatial_key(0x8000_0000, 0), 1 << 63);
        assert_eq!(spatial_key(u32::MAX, u32::MAX), u64::MAX);
    }

    #[test]
    fn test_point_feature_with_id() {
        let harness = Harness::new(Config::default());
        let mut segment = harness.segment();
        let feature = json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [-122.4, 37.8]},
            "properties": {"name": "x"},
            "id": 5
        });
        let source = FeatureSource {
            geometry: &feature["geometry"],
            properties: feature.get("properties"),
            id: feature.get("id"),
            tippecanoe: None,
            feature: &feature,
            line: 1,
        };

        let entry = harness.builder().build(&source, &mut segment).unwrap().unwrap();
        assert_eq!(entry.feature_type, FeatureType::Point);
        assert_eq!(entry.seq, 0);

        let (record, _) = decode_only_record(segment, harness.config.geometry_scale);
        assert_eq!(record.geometry.len(), 1);
        assert_eq!(record.geometry[0].op, Op::MoveTo);
        assert!(record.has_id());
        assert_eq!(record.id, Some(5));

        let MetadataPlacement::Inline(pairs) = &record.metadata else {
            panic!("expected inline metadata");
        };
        assert_eq!(pairs.len(), 1);
        let (k, v) = pairs[0];
        assert_eq!(harness.pool.resolve(k).unwrap().text, "name");
        assert_eq!(
            harness.pool.resolve(v).unwrap(),
            AttributeValue::new(AttributeType::String, "x")
        );
        assert_eq!(harness.layers.get("default").unwrap().points, 1);
    }

    #[test]
    fn test_empty_polygon_is_still_emitted() {
        let harness = Harness::new(Config::default());
        let mut segment = harness.segment();
        let geometry = json!({"type": "Polygon", "coordinates": []});

        let entry = harness
            .builder()
            .build(&FeatureSource::bare(&geometry, 1), &mut segment)
            .unwrap();
        assert!(entry.is_some());
        assert!(segment.origin.is_none());

        let (record, _) = decode_only_record(segment, 6);
        assert_eq!(record.feature_type, FeatureType::Polygon);
        assert!(record.geometry.is_empty());
    }

    #[test]
    fn test_negative_id_warns_once() {
        let harness = Harness::new(Config::default());
        let mut segment = harness.segment();
        let geometry = json!({"type": "Point", "coordinates": [1, 2]});
        let id = json!(-3);

        for line in 1..=5 {
            let source = FeatureSource {
                id: Some(&id),
                ..FeatureSource::bare(&geometry, line)
            };
            harness.builder().build(&source, &mut segment).unwrap();
        }

        assert!(harness.diagnostics.emitted(Warning::NegativeId));
        assert_eq!(harness.diagnostics.occurrences(Warning::NegativeId), 5);
        let (record, _) = decode_only_record(segment, 6);
        assert!(!record.has_id());
    }

    #[test]
    fn test_id_validation() {
        let diagnostics = Diagnostics::new();
        assert_eq!(validate_id(&json!(0), &diagnostics), Some(0));
        assert_eq!(validate_id(&json!(u64::MAX), &diagnostics), Some(u64::MAX));
        assert_eq!(validate_id(&json!(1.5), &diagnostics), None);
        assert!(diagnostics.emitted(Warning::FractionalId));
        assert_eq!(validate_id(&json!("7"), &diagnostics), None);
        assert!(diagnostics.emitted(Warning::NonNumericId));
        assert!(!diagnostics.emitted(Warning::NegativeId));
    }

    #[test]
    fn test_negative_zero_id_is_zero() {
        let diagnostics = Diagnostics::new();
        let parse = |text: &str| serde_json::from_str::<Value>(text).unwrap();

        assert_eq!(validate_id(&parse("-0"), &diagnostics), Some(0));
        assert!(!diagnostics.emitted(Warning::NegativeId));
        assert!(!diagnostics.emitted(Warning::FractionalId));

        assert_eq!(validate_id(&parse("-0.0"), &diagnostics), None);
        assert!(diagnostics.emitted(Warning::FractionalId));
        assert_eq!(validate_id(&parse("-3"), &diagnostics), None);
        assert!(diagnostics.emitted(Warning::NegativeId));
    }

    #[test]
    fn test_zoom_override_minus_one_is_absent() {
        assert_eq!(zoom_override(Some(&json!(-1))), None);
        assert_eq!(zoom_override(Some(&json!("-1"))), None);
        assert_eq!(zoom_override(Some(&json!(-1.0))), None);
        assert_eq!(zoom_override(Some(&json!(-2))), Some(-2));
        assert_eq!(zoom_override(Some(&json!(0))), Some(0));
        assert_eq!(zoom_override(Some(&json!(true))), None);
        assert_eq!(zoom_override(None), None);
    }

    #[test]
    fn test_wide_feature_gets_external_metadata() {
        let harness = Harness::new(Config::default());
        let mut segment = harness.segment();
        let feature = json!({
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[-10, 0], [10, 5]]},
            "properties": {"name": "long", "lanes": 2}
        });
        let source = FeatureSource {
            geometry: &feature["geometry"],
            properties: feature.get("properties"),
            id: None,
            tippecanoe: None,
            feature: &feature,
            line: 3,
        };
        harness.builder().build(&source, &mut segment).unwrap();

        let (record, metadata) = decode_only_record(segment, 6);
        let MetadataPlacement::External { offset, count } = record.metadata else {
            panic!("expected external metadata");
        };
        assert_eq!(record.metadata.metapos(), 0);

        let mut pool_buffer = Vec::new();
        harness.pool.write_to(&mut pool_buffer).unwrap();
        let resolved: Vec<(String, AttributeValue)> = read_metadata(&metadata, offset, count)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (resolve_in(&pool_buffer, k).unwrap().text, resolve_in(&pool_buffer, v).unwrap()))
            .collect();
        assert_eq!(
            resolved,
            vec![
                ("name".to_string(), AttributeValue::new(AttributeType::String, "long")),
                ("lanes".to_string(), AttributeValue::new(AttributeType::Number, "2")),
            ]
        );
    }

    #[test]
    fn test_placement_depends_only_on_span() {
        let narrow = BoundingBox {
            min_x: 0,
            min_y: 0,
            max_x: 2 << 18,
            max_y: 10,
        };
        let wide = BoundingBox {
            max_x: (2 << 18) + 1,
            ..narrow
        };
        let limit = Config::default().external_metadata_span();
        assert!(!MetadataPlacement::is_external(&narrow, limit));
        assert!(MetadataPlacement::is_external(&wide, limit));
        assert!(!MetadataPlacement::is_external(&BoundingBox::EMPTY, limit));

        let coarse = Config {
            maxzoom: 10,
            ..Config::default()
        };
        assert!(!MetadataPlacement::is_external(&wide, coarse.external_metadata_span()));
    }

    #[test]
    fn test_unclipped_guard_is_fatal() {
        let harness = Harness::new(Config {
            prevent_clipping: true,
            ..Config::default()
        });
        let mut segment = harness.segment();
        let geometry = json!({"type": "LineString", "coordinates": [[-60, -60], [60, 60]]});

        let err = harness
            .builder()
            .build(&FeatureSource::bare(&geometry, 9), &mut segment)
            .unwrap_err();
        assert!(matches!(err, IngestError::UnclippedFeatureTooLarge { .. }));
        assert!(err.to_string().starts_with("test.json:9:"));
    }

    #[test]
    fn test_overrides() {
        let harness = Harness::new(Config {
            preserve_input_order: true,
            ..Config::default()
        });
        let mut segment = harness.segment();
        let geometry = json!({"type": "Point", "coordinates": [0, 0]});
        let tippecanoe = json!({"minzoom": "3abc", "maxzoom": 9.7, "layer": 12});

        for line in 1..=2 {
            let source = FeatureSource {
                tippecanoe: Some(&tippecanoe),
                ..FeatureSource::bare(&geometry, line)
            };
            harness.builder().build(&source, &mut segment).unwrap();
        }

        let origin = segment.origin.map(|o| o.scaled(6)).unwrap();
        let (geometry_stream, _, _) = segment.output.into_inner();
        let mut r = &geometry_stream[..];
        let first = read_record(&mut r, origin).unwrap();
        let second = read_record(&mut r, origin).unwrap();

        assert_eq!(first.minzoom, Some(3));
        assert_eq!(first.maxzoom, Some(9));
        assert_eq!((first.seq, second.seq), (0, 1));
        assert_eq!(first.layer, harness.layers.resolve("12"));
        assert_eq!(harness.layers.get("12").unwrap().points, 2);
        assert!(harness.layers.get("default").is_none());
    }

    #[test]
    fn test_skipped_geometries() {
        let harness = Harness::new(Config::default());
        let mut segment = harness.segment();
        let builder = harness.builder();

        let no_type = json!({"coordinates": [0, 0]});
        let bad_type = json!({"type": 3, "coordinates": [0, 0]});
        let no_coords = json!({"type": "Point"});
        let unknown = json!({"type": "Circle", "coordinates": [0, 0]});
        for geometry in [&no_type, &bad_type, &no_coords, &unknown] {
            let built = builder.build(&FeatureSource::bare(geometry, 1), &mut segment).unwrap();
            assert!(built.is_none());
        }

        assert!(harness.diagnostics.emitted(Warning::NullGeometry));
        assert_eq!(segment.records, 0);
        assert_eq!(harness.progress.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_attribute_filters_and_forced_types() {
        let mut config = Config::default();
        config.exclude.insert("skip".to_string());
        config
            .attribute_types
            .insert("n".to_string(), crate::attribute::ForcedType::Int);
        let harness = Harness::new(config);
        let mut segment = harness.segment();

        let feature = json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [0, 0]},
            "properties": {"skip": "a", "n": "42", "nothing": null}
        });
        let source = FeatureSource {
            geometry: &feature["geometry"],
            properties: feature.get("properties"),
            id: None,
            tippecanoe: None,
            feature: &feature,
            line: 1,
        };
        harness.builder().build(&source, &mut segment).unwrap();

        let layer = harness.layers.get("default").unwrap();
        assert_eq!(layer.file_keys.keys().collect::<Vec<_>>(), vec!["n"]);
        assert!(layer.file_keys["n"].types.contains(&AttributeType::Number));
    }

    #[test]
    fn test_extent() {
        let square = vec![
            DrawOp::new(Op::MoveTo, 0, 0),
            DrawOp::new(Op::LineTo, 3, 0),
            DrawOp::new(Op::LineTo, 3, 3),
            DrawOp::new(Op::LineTo, 0, 3),
            DrawOp::new(Op::LineTo, 0, 0),
        ];
        assert_eq!(feature_extent(FeatureType::Polygon, &square), 9.0);

        let line = vec![
            DrawOp::new(Op::MoveTo, 0, 0),
            DrawOp::new(Op::LineTo, 3, 4),
            DrawOp::new(Op::MoveTo, 10, 10),
            DrawOp::new(Op::LineTo, 10, 12),
        ];
        assert_eq!(feature_extent(FeatureType::Line, &line), 7.0);
        assert_eq!(feature_extent(FeatureType::Point, &line), 0.0);
    }

    #[test]
    fn test_distance_stats() {
        let mut stats = DistanceStats::default();
        stats.sample(&[DrawOp::new(Op::MoveTo, 5, 5)], 0);
        assert_eq!(stats.mean_spacing_ft(), None);

        let geom = vec![
            DrawOp::new(Op::MoveTo, 0, 0),
            DrawOp::new(Op::LineTo, 0, 0),
            DrawOp::new(Op::LineTo, 33, 0),
        ];
        stats.sample(&geom, 0);
        assert_eq!(stats.count, 1);
        // The bits of x land on the odd positions of the key
        let gap = spatial_key(33, 0) as f64;
        let expected = gap.sqrt() / 33.0;
        assert!((stats.mean_spacing_ft().unwrap() - expected).abs() < 1e-9);

        let mut merged = DistanceStats::default();
        merged.merge(&stats);
        merged.merge(&stats);
        assert_eq!(merged.count, 2);
    }

    #[test]
    fn test_leading_int() {
        assert_eq!(leading_int("12"), 12);
        assert_eq!(leading_int(" -4z"), -4);
        assert_eq!(leading_int("z"), 0);
        assert_eq!(leading_int("99999999999"), i32::MAX);
    }
}
