//! One complete run: probe the source, then decode, interpolate and
//! encode concurrently until every output frame is written.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::config::AppConfig;
use crate::engine::{EngineCommand, ProcessLauncher};
use crate::error::PipelineError;
use crate::probe::{self, FrameRate, StreamMetadata};
use crate::scheduler::{InterpolationScheduler, ProgressCallback};
use crate::sink::{EncoderConfig, VideoEncoder};
use crate::source::VideoDecoder;

/// `<dir>/<stem>_<fps>fps.mp4` next to the input, with the output frame
/// rate printed to two decimals.
pub fn default_output_path(input: &Path, output_rate: FrameRate) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{stem}_{:.2}fps.mp4", output_rate.as_f64());
    match input.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub input: PathBuf,
    /// Derived with [`default_output_path`] when absent.
    pub output: Option<PathBuf>,
    pub config: AppConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source: StreamMetadata,
    pub output_frame_rate: FrameRate,
    pub frames_written: u64,
    pub elapsed: Duration,
}

/// Whether two spellings name the same file. Paths that exist are compared
/// after symlink resolution, the rest after making them absolute.
fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => match (std::path::absolute(a), std::path::absolute(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        },
    }
}

/// Resolve the output path, rejecting one that would overwrite the input.
pub fn resolve_output_path(request: &RunRequest, metadata: &StreamMetadata) -> Result<PathBuf> {
    let output = request
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&request.input, metadata.output_frame_rate()));
    if same_file(&output, &request.input) {
        return Err(PipelineError::Configuration(format!(
            "output path {} is the input file",
            output.display()
        ))
        .into());
    }
    Ok(output)
}

pub fn engine_command(config: &AppConfig) -> EngineCommand {
    EngineCommand {
        program: config.engine.program.clone(),
        args: config.engine.args.clone(),
        request_timeout: config.engine.request_timeout(),
    }
}

/// Run the whole pipeline for one input file.
///
/// Configuration is validated against the probed stream before the decoder,
/// encoder or any engine is started.
pub async fn run(
    request: RunRequest,
    cancel: watch::Receiver<bool>,
    progress: Option<ProgressCallback>,
) -> Result<RunSummary> {
    let started = Instant::now();
    let input = request.input.clone();

    let probe_input = input.clone();
    let metadata = tokio::task::spawn_blocking(move || probe::probe(&probe_input))
        .await
        .context("probe task panicked")??;
    let output = resolve_output_path(&request, &metadata)?;
    let geometry = metadata.geometry();
    let output_rate = metadata.output_frame_rate();

    info!(
        input = %input.display(),
        output = %output.display(),
        frames = metadata.frames,
        output_frames = metadata.output_frames(),
        fps = %metadata.frame_rate,
        output_fps = %output_rate,
        width = metadata.width,
        height = metadata.height,
        rotation = metadata.rotation,
        "Processing video file"
    );

    let launcher = Arc::new(ProcessLauncher::new(engine_command(&request.config)));
    let mut scheduler = InterpolationScheduler::new(
        launcher,
        geometry,
        metadata.frames,
        request.config.engine.workers,
    )?
    .with_buffer_size(request.config.pipeline.buffer_size);
    if let Some(progress) = progress {
        scheduler = scheduler.with_progress(progress);
    }

    let decoder = VideoDecoder::new(&input, geometry)?;
    let encoder = VideoEncoder::new(&EncoderConfig::new(
        input.clone(),
        output.clone(),
        geometry,
        output_rate,
        &request.config.encoder,
    ))?;

    let frames_written = scheduler.run(decoder, encoder, cancel).await?;
    let elapsed = started.elapsed();

    info!(
        output = %output.display(),
        frames = frames_written,
        elapsed_secs = format!("{:.1}", elapsed.as_secs_f64()),
        "Finished video file"
    );

    Ok(RunSummary {
        input,
        output,
        source: metadata,
        output_frame_rate: output_rate,
        frames_written,
        elapsed,
    })
}
