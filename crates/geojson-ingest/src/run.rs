use crate::settings::Settings;
use anyhow::Context;
use geojson_ingest_lib::{IngestRun, SegmentOutput, SegmentTask};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// One input buffer and the names it is reported and layered under
struct Input {
    source: String,
    layer: String,
    bytes: Vec<u8>,
}

/// Ingest every input of `settings` into its output directory
pub fn run(settings: &Settings) -> anyhow::Result<()> {
    let config = settings.to_config()?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.threads.unwrap_or(0))
        .build()
        .context("Failed to start worker threads")?;

    let inputs = read_inputs(settings)?;
    fs::create_dir_all(&settings.output)
        .with_context(|| format!("Failed to create {}", settings.output.display()))?;

    let run = IngestRun::new(config)?;
    let summary = pool.install(|| -> anyhow::Result<_> {
        let tasks = plan_tasks(&inputs, settings.read_parallel, rayon::current_num_threads());
        tracing::info!("Reading {} inputs in {} segments", inputs.len(), tasks.len());

        let (summary, outputs) = run.ingest_all(tasks, |task| {
            let open = |prefix: &str| -> std::io::Result<BufWriter<File>> {
                let path = settings.output.join(format!("{prefix}.{}", task.segment));
                Ok(BufWriter::new(File::create(path)?))
            };
            Ok(SegmentOutput::new(open("geom")?, open("meta")?, open("index")?))
        })?;
        drop(outputs);
        Ok(summary)
    })?;

    let mut pool_file = BufWriter::new(create(&settings.output.join("pool.bin"))?);
    run.pool().write_to(&mut pool_file)?;
    pool_file.flush()?;

    write_json(&settings.output.join("layers.json"), &summary.layers)?;
    write_json(&settings.output.join("summary.json"), &summary)?;

    tracing::info!(
        "Wrote {} features in {} layers, {} pooled attribute strings ({} bytes)",
        summary.records,
        summary.layers.len(),
        summary.pool_entries,
        summary.pool_bytes
    );
    if let Some(spacing) = summary.mean_spacing_ft() {
        tracing::info!("Mean spacing between feature points: {spacing:.1} ft");
    }
    for segment in summary.segments.iter().filter(|s| s.source_error.is_some()) {
        tracing::warn!("Segment {} of {} ended early", segment.segment, segment.source);
    }

    Ok(())
}

fn read_inputs(settings: &Settings) -> anyhow::Result<Vec<Input>> {
    if settings.inputs.is_empty() {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .context("Failed to read standard input")?;
        return Ok(vec![Input {
            source: "standard input".to_string(),
            layer: settings.layer.clone().unwrap_or_else(|| "stdin".to_string()),
            bytes,
        }]);
    }

    settings
        .inputs
        .iter()
        .map(|path| {
            let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Input {
                source: path.display().to_string(),
                layer: settings.layer.clone().unwrap_or_else(|| layer_name(path)),
                bytes,
            })
        })
        .collect()
}

/// Layer named after a file: its name without directories or extension
fn layer_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Segments numbered consecutively over all inputs
fn plan_tasks(inputs: &[Input], split: bool, pieces: usize) -> Vec<SegmentTask<'_>> {
    let mut tasks: Vec<SegmentTask<'_>> = Vec::new();
    for input in inputs {
        let next = tasks.len() as u32;
        if split {
            tasks.extend(SegmentTask::split(&input.bytes, &input.source, &input.layer, next, pieces));
        } else {
            tasks.push(SegmentTask {
                segment: next,
                source: input.source.clone(),
                layer: input.layer.clone(),
                input: &input.bytes,
                first_line: 1,
            });
        }
    }
    tasks
}

fn create(path: &Path) -> anyhow::Result<File> {
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}
