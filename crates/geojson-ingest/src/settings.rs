use clap::Parser;
use geojson_ingest_lib::{Config, ForcedType, IndexKeyPolicy, Projection, parse_forced_type};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// GeoJSON Ingest - Convert GeoJSON features into intermediate tile-building streams
pub struct Settings {
    /// GeoJSON files to read (standard input if none)
    #[clap(value_name = "FILE")]
    pub inputs: Vec<PathBuf>,

    /// Directory the geometry, metadata, index and pool streams are written to
    #[clap(short, long, value_name = "DIR")]
    pub output: PathBuf,

    /// Layer name for all inputs (default: each file's name without extension)
    #[clap(short, long)]
    pub layer: Option<String>,

    /// Maximum zoom level the output will be built for
    #[clap(short = 'z', long, default_value = "14")]
    pub maximum_zoom: u32,

    /// Bits of detail kept at the maximum zoom level
    #[clap(short = 'd', long, default_value = "12")]
    pub full_detail: u32,

    /// Projection of the input coordinates (EPSG:4326 or EPSG:3857)
    #[clap(short = 's', long, default_value = "EPSG:4326")]
    pub projection: String,

    /// Keep features continuous when they cross the antimeridian
    #[clap(long, default_value = "false")]
    pub detect_longitude_wraparound: bool,

    /// Features will not be clipped at tile boundaries
    #[clap(long, default_value = "false")]
    pub no_clipping: bool,

    /// Record input order so it can be restored downstream
    #[clap(long, default_value = "false")]
    pub preserve_input_order: bool,

    /// Compute feature areas and lengths for smallest-first dropping
    #[clap(long, default_value = "false")]
    pub drop_smallest_as_needed: bool,

    /// Store spatial keys for densest-first dropping
    #[clap(long, default_value = "false")]
    pub drop_densest_as_needed: bool,

    /// Store spatial keys for feature density calculation
    #[clap(long, default_value = "false")]
    pub calculate_feature_density: bool,

    /// Store spatial keys for automatic gamma increase
    #[clap(long, default_value = "false")]
    pub increase_gamma_as_needed: bool,

    /// Rate at which dense points are dropped (0 disables)
    #[clap(short = 'g', long, default_value = "0.0")]
    pub gamma: f64,

    /// Measure the mean spacing between feature points
    #[clap(long, default_value = "false")]
    pub distance_stats: bool,

    /// Attribute to leave out (repeatable)
    #[clap(short = 'x', long)]
    pub exclude: Vec<String>,

    /// Attribute to keep when all others are excluded (repeatable)
    #[clap(short = 'y', long)]
    pub include: Vec<String>,

    /// Leave out every attribute not named with --include
    #[clap(short = 'X', long, default_value = "false")]
    pub exclude_all: bool,

    /// Force an attribute's type, as key:type with type one of string, float, int or bool (repeatable)
    #[clap(short = 'T', long, value_name = "KEY:TYPE")]
    pub attribute_type: Vec<String>,

    /// Split line-delimited input into segments read in parallel
    #[clap(short = 'P', long, default_value = "false")]
    pub read_parallel: bool,

    /// Worker threads (default: one per core)
    #[clap(long)]
    pub threads: Option<usize>,

    /// Tile replication estimate above which an unclipped feature aborts the run
    #[clap(long, default_value = "10000")]
    pub unclipped_tile_limit: i64,
}

impl Settings {
    /// Build the ingestion configuration
    pub fn to_config(&self) -> geojson_ingest_lib::Result<Config> {
        let attribute_types: BTreeMap<String, ForcedType> = self
            .attribute_type
            .iter()
            .map(|spec| parse_forced_type(spec))
            .collect::<geojson_ingest_lib::Result<_>>()?;

        let config = Config {
            maxzoom: self.maximum_zoom,
            geometry_scale: Config::geometry_scale_for(self.maximum_zoom, self.full_detail),
            projection: self.projection.parse::<Projection>()?,
            detect_wraparound: self.detect_longitude_wraparound,
            prevent_clipping: self.no_clipping,
            preserve_input_order: self.preserve_input_order,
            drop_smallest_as_needed: self.drop_smallest_as_needed,
            index_key: IndexKeyPolicy {
                drop_densest_as_needed: self.drop_densest_as_needed,
                calculate_feature_density: self.calculate_feature_density,
                increase_gamma_as_needed: self.increase_gamma_as_needed,
                uses_gamma: self.gamma > 0.0,
            },
            want_distance_stats: self.distance_stats,
            exclude: self.exclude.iter().cloned().collect(),
            exclude_all: self.exclude_all,
            include: self.include.iter().cloned().collect(),
            attribute_types,
            unclipped_tile_limit: self.unclipped_tile_limit,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }
}
