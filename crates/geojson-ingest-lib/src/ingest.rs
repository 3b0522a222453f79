//! Classification of input values and per-segment ingestion
//!
//! An [`IngestRun`] owns everything shared by the segments of a run: configuration,
//! metadata pool, layer registry and warn-once diagnostics. Each [`SegmentTask`] is
//! ingested by its own [`IngestionDriver`] into its own [`SegmentOutput`], in parallel.

use crate::config::Config;
use crate::diagnostics::{Diagnostics, json_context};
use crate::feature::{DistanceStats, FeatureRecordBuilder, FeatureSource};
use crate::geometry::GeometryKind;
use crate::layer::{LayerEntry, LayerMap};
use crate::normalize::{BoundingBox, Origin};
use crate::pool::MetadataPool;
use crate::reader::{self, Container, StreamEnd};
use crate::serial::SegmentOutput;
use crate::{IngestError, Projection, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Objects seen without any feature or geometry before warning about the input
const UNRECOGNIZED_OBJECT_LIMIT: u64 = 50;

/// State of one segment's ingestion
#[derive(Debug)]
pub struct SegmentContext<W> {
    pub segment: u32,
    /// Input name used in diagnostics
    pub source: String,
    /// Layer of features without a layer override
    pub layer_name: String,
    /// Reference origin, captured from the first coordinate of the segment
    pub origin: Option<Origin>,
    pub output: SegmentOutput<W>,
    /// Sequence number of the next record
    pub layer_seq: i64,
    /// Union of the bounding boxes of all records
    pub bbox: BoundingBox,
    pub distance: DistanceStats,
    pub records: u64,
}

impl<W: Write> SegmentContext<W> {
    pub fn new(
        segment: u32,
        source: impl Into<String>,
        layer_name: impl Into<String>,
        output: SegmentOutput<W>,
    ) -> Self {
        Self {
            segment,
            source: source.into(),
            layer_name: layer_name.into(),
            origin: None,
            output,
            layer_seq: 0,
            bbox: BoundingBox::EMPTY,
            distance: DistanceStats::default(),
            records: 0,
        }
    }
}

/// Where the driver is in its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    SeekingTopLevel,
    /// End of input reached
    Finished,
    /// The input could not be read further
    SourceError,
}

/// Warning about a segment's input as a whole, raised at most once per occasion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputNotice {
    /// Many objects read without finding any feature or geometry
    NothingRecognized,
    /// Features found after bare geometries
    MixedFeaturesAndGeometries,
    /// A FeatureCollection declared a CRS other than the configured projection
    ProjectionMismatch,
}

/// What a JSON object turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    BareGeometry,
    Feature,
    FeatureCollection,
    Skip,
}

/// Reads one segment's values and dispatches the features it finds
pub struct IngestionDriver<'r> {
    builder: FeatureRecordBuilder<'r>,
    projection: Projection,
    state: DriverState,
    found_hashes: u64,
    found_features: u64,
    found_geometries: u64,
    notices: Vec<InputNotice>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<'r> IngestionDriver<'r> {
    pub fn new(builder: FeatureRecordBuilder<'r>, projection: Projection) -> Self {
        Self {
            builder,
            projection,
            state: DriverState::SeekingTopLevel,
            found_hashes: 0,
            found_features: 0,
            found_geometries: 0,
            notices: Vec::new(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Number of Features seen, including ones that were skipped
    pub fn found_features(&self) -> u64 {
        self.found_features
    }

    /// Number of bare geometries seen
    pub fn found_geometries(&self) -> u64 {
        self.found_geometries
    }

    /// Input warnings raised so far, in order
    pub fn notices(&self) -> &[InputNotice] {
        &self.notices
    }

    /// Ingest every value of `input`, whose first byte is on line `first_line`
    ///
    /// Features are written as soon as they are read. A syntax error in the input ends
    /// the segment with a warning, keeping what was written before it. Invalid UTF-8 in
    /// the value of a kept attribute and fatal encoding errors are returned.
    pub fn run<W: Write>(
        &mut self,
        input: &[u8],
        first_line: u64,
        segment: &mut SegmentContext<W>,
    ) -> Result<StreamEnd> {
        let end = reader::stream_objects(input, first_line, |object, parents, line| {
            self.dispatch(object, parents, line, segment)
        });
        let end = match end {
            Ok(end) => end,
            Err(err) => {
                self.state = DriverState::SourceError;
                return Err(err);
            }
        };

        if let (Some(message), Some(key)) = (&end.invalid_utf8, &end.attribute)
            && self.builder.config().keeps_attribute(key)
        {
            self.state = DriverState::SourceError;
            return Err(IngestError::InvalidUtf8 {
                location: format!("{}:{}", segment.source, end.line),
                message: format!("{message} in the value of attribute {key:?}"),
            });
        }

        self.state = match &end.error {
            Some(error) => {
                tracing::warn!("{}:{}: {}", segment.source, end.line, error);
                DriverState::SourceError
            }
            None => DriverState::Finished,
        };
        Ok(end)
    }

    /// Handle one completed object, returning whether it was consumed
    fn dispatch<W: Write>(
        &mut self,
        object: &Value,
        parents: &[Container],
        line: u64,
        segment: &mut SegmentContext<W>,
    ) -> Result<bool> {
        match self.classify(object, parents, line, &segment.source) {
            Classification::BareGeometry => {
                self.found_geometries += 1;
                self.builder.build(&FeatureSource::bare(object, line), segment)?;
                Ok(true)
            }
            Classification::Feature => {
                self.emit_feature(object, line, segment)?;
                Ok(true)
            }
            Classification::FeatureCollection => {
                self.check_crs(object, &segment.source);
                Ok(false)
            }
            Classification::Skip => Ok(false),
        }
    }

    fn classify(&mut self, object: &Value, parents: &[Container], line: u64, source: &str) -> Classification {
        self.found_hashes += 1;
        if self.found_hashes == UNRECOGNIZED_OBJECT_LIMIT && self.found_features == 0 && self.found_geometries == 0 {
            tracing::warn!(
                "{source}:{line}: Warning: not finding any GeoJSON features or geometries in input yet after {UNRECOGNIZED_OBJECT_LIMIT} objects."
            );
            self.notices.push(InputNotice::NothingRecognized);
        }

        let Some(type_name) = object.get("type").and_then(Value::as_str) else {
            return Classification::Skip;
        };

        if self.found_features == 0
            && GeometryKind::from_name(type_name).is_some()
            && !is_embedded_geometry(parents)
        {
            return Classification::BareGeometry;
        }

        match type_name {
            "Feature" => Classification::Feature,
            "FeatureCollection" => Classification::FeatureCollection,
            _ => Classification::Skip,
        }
    }

    fn emit_feature<W: Write>(&mut self, feature: &Value, line: u64, segment: &mut SegmentContext<W>) -> Result<()> {
        if self.found_features == 0 && self.found_geometries != 0 {
            tracing::warn!(
                "{}:{line}: Warning: found a mixture of features and bare geometries",
                segment.source
            );
            self.notices.push(InputNotice::MixedFeaturesAndGeometries);
        }
        self.found_features += 1;

        let Some(geometry) = feature.get("geometry") else {
            tracing::warn!(
                "{}:{line}: feature with no geometry in JSON object {}",
                segment.source,
                json_context(feature)
            );
            return Ok(());
        };

        let properties = feature.get("properties");
        if !properties.is_some_and(|p| p.is_object() || p.is_null()) {
            tracing::warn!(
                "{}:{line}: feature without properties hash in JSON object {}",
                segment.source,
                json_context(feature)
            );
            return Ok(());
        }

        let source = FeatureSource {
            geometry,
            properties,
            id: feature.get("id"),
            tippecanoe: feature.get("tippecanoe"),
            feature,
            line,
        };

        match geometry.get("geometries") {
            Some(geometries) => {
                for member in geometries.as_array().into_iter().flatten() {
                    let member_source = FeatureSource {
                        geometry: member,
                        ..source
                    };
                    self.builder.build(&member_source, segment)?;
                }
            }
            None => {
                self.builder.build(&source, segment)?;
            }
        }
        Ok(())
    }

    /// Warn if a FeatureCollection declares a different CRS than the configured one
    fn check_crs(&mut self, collection: &Value, source: &str) {
        let Some(name) = collection
            .pointer("/crs/properties/name")
            .and_then(Value::as_str)
        else {
            return;
        };

        let expected = self.projection.alias();
        if name != expected {
            tracing::warn!("{source}: Warning: GeoJSON specified projection \"{name}\", not the expected \"{expected}\".");
            tracing::warn!(
                "{source}: If \"{expected}\" is not the expected projection, use --projection to specify the right one."
            );
            self.notices.push(InputNotice::ProjectionMismatch);
        }
    }
}

/// Whether a geometry object is part of a Feature or a GeometryCollection
fn is_embedded_geometry(parents: &[Container]) -> bool {
    match parents {
        [.., grandparent, parent] if parent.is_array() => grandparent.has_key("geometries"),
        [.., parent] => parent.has_key("geometry"),
        [] => false,
    }
}

/// One unit of parallel work: a slice of input and where its records go
#[derive(Debug, Clone)]
pub struct SegmentTask<'a> {
    pub segment: u32,
    /// Input name used in diagnostics
    pub source: String,
    /// Layer of features without a layer override
    pub layer: String,
    pub input: &'a [u8],
    /// Line number of the first byte of `input`
    pub first_line: u64,
}

impl<'a> SegmentTask<'a> {
    /// Tasks for `input`, split at newlines into up to `count` segments numbered from
    /// `first_segment`
    pub fn split(
        input: &'a [u8],
        source: &str,
        layer: &str,
        first_segment: u32,
        count: usize,
    ) -> Vec<SegmentTask<'a>> {
        reader::split_segments(input, count)
            .into_iter()
            .zip(first_segment..)
            .map(|(span, segment)| SegmentTask {
                segment,
                source: source.to_string(),
                layer: layer.to_string(),
                input: &input[span.range],
                first_line: span.first_line,
            })
            .collect()
    }
}

/// What one segment produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub segment: u32,
    pub source: String,
    pub records: u64,
    pub features: u64,
    pub bare_geometries: u64,
    /// Full-resolution origin that geometry deltas are relative to
    pub origin: Option<Origin>,
    pub bbox: BoundingBox,
    pub distance: DistanceStats,
    pub geometry_bytes: u64,
    pub metadata_bytes: u64,
    pub index_bytes: u64,
    /// Input error that ended the segment early
    pub source_error: Option<String>,
    /// Warnings about the input as a whole
    pub notices: Vec<InputNotice>,
}

/// What a whole run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Per-segment results in segment order
    pub segments: Vec<SegmentSummary>,
    pub records: u64,
    /// Union of every record's bounding box
    pub bbox: BoundingBox,
    pub distance: DistanceStats,
    pub layers: Vec<LayerEntry>,
    pub pool_entries: usize,
    pub pool_bytes: u64,
}

impl RunSummary {
    /// Log-mean spacing between feature points in feet, if it was measured
    pub fn mean_spacing_ft(&self) -> Option<f64> {
        self.distance.mean_spacing_ft()
    }
}

/// Shared state of one ingestion run
#[derive(Debug)]
pub struct IngestRun {
    config: Config,
    pool: MetadataPool,
    layers: LayerMap,
    diagnostics: Diagnostics,
    progress: AtomicU64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl IngestRun {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool: MetadataPool::new(),
            layers: LayerMap::new(),
            diagnostics: Diagnostics::new(),
            progress: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &MetadataPool {
        &self.pool
    }

    pub fn layers(&self) -> &LayerMap {
        &self.layers
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Features written so far over all segments
    pub fn features_written(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    fn builder(&self) -> FeatureRecordBuilder<'_> {
        FeatureRecordBuilder::new(&self.config, &self.pool, &self.layers, &self.diagnostics, &self.progress)
    }

    /// Ingest one segment to completion
    pub fn ingest_segment<W: Write>(
        &self,
        task: &SegmentTask<'_>,
        output: SegmentOutput<W>,
    ) -> Result<(SegmentSummary, SegmentOutput<W>)> {
        #[cfg(feature = "profiling")]
        profiling::scope!("ingest::segment");

        // Features without an override still belong to the segment's layer, even if there are none
        self.layers.resolve(&task.layer);

        let mut context = SegmentContext::new(task.segment, task.source.as_str(), task.layer.as_str(), output);
        let mut driver = IngestionDriver::new(self.builder(), self.config.projection);
        let end = driver.run(task.input, task.first_line, &mut context)?;
        context.output.flush()?;

        let summary = SegmentSummary {
            segment: task.segment,
            source: task.source.clone(),
            records: context.records,
            features: driver.found_features(),
            bare_geometries: driver.found_geometries(),
            origin: context.origin,
            bbox: context.bbox,
            distance: context.distance,
            geometry_bytes: context.output.geometry.position(),
            metadata_bytes: context.output.metadata.position(),
            index_bytes: context.output.index.position(),
            source_error: end.error,
            notices: driver.notices().to_vec(),
        };
        tracing::debug!(
            "Segment {} of {}: {} records, {} geometry bytes",
            summary.segment,
            summary.source,
            summary.records,
            summary.geometry_bytes
        );

        Ok((summary, context.output))
    }

    /// Ingest all tasks in parallel
    ///
    /// `make_output` opens the streams of a task. The first fatal error of any segment
    /// ends the run.
    pub fn ingest_all<W, F>(&self, tasks: Vec<SegmentTask<'_>>, make_output: F) -> Result<(RunSummary, Vec<SegmentOutput<W>>)>
    where
        W: Write + Send,
        F: Fn(&SegmentTask<'_>) -> Result<SegmentOutput<W>> + Sync,
    {
        #[cfg(feature = "profiling")]
        profiling::scope!("ingest::all");

        let results: Result<Vec<(SegmentSummary, SegmentOutput<W>)>> = tasks
            .into_par_iter()
            .map(|task| {
                let output = make_output(&task)?;
                self.ingest_segment(&task, output)
            })
            .collect();

        let (segments, outputs): (Vec<SegmentSummary>, Vec<SegmentOutput<W>>) = results?.into_iter().unzip();
        Ok((self.summarize(segments), outputs))
    }

    /// Merge segment summaries, in segment order
    pub fn summarize(&self, mut segments: Vec<SegmentSummary>) -> RunSummary {
        segments.sort_by_key(|s| s.segment);

        let mut bbox = BoundingBox::EMPTY;
        let mut distance = DistanceStats::default();
        for segment in &segments {
            bbox.union(&segment.bbox);
            distance.merge(&segment.distance);
        }

        RunSummary {
            records: segments.iter().map(|s| s.records).sum(),
            segments,
            bbox,
            distance,
            layers: self.layers.snapshot(),
            pool_entries: self.pool.len(),
            pool_bytes: self.pool.byte_len(),
        }
    }
}
