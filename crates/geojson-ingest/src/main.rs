use clap::Parser;
use geojson_ingest::{Settings, logging, run};

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    logging::setup_logging();

    tracing::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    run(&settings)?;
    Ok(())
}
