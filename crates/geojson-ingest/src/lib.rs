//! GeoJSON Ingest - command-line front end
//!
//! Reads GeoJSON files (or standard input), ingests them with [`geojson_ingest_lib`]
//! and writes the resulting streams to an output directory:
//!
//! - `geom.N`, `meta.N`, `index.N`: geometry, metadata and index streams of segment `N`
//! - `pool.bin`: the shared attribute pool
//! - `layers.json`: the layer registry with attribute statistics
//! - `summary.json`: per-segment origins, bounding boxes and sizes

pub mod logging;
mod run;
mod settings;

pub use run::run;
pub use settings::Settings;
