use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilesr_core::config::{AppConfig, ConfigOverrides, OutputFormat};
use tilesr_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use tilesr_core::protocol::{
    default_session_factory, spawn_worker, ModelPaths, PipelineEvent, PipelineRequest,
    WorkerHandle,
};

#[derive(Parser)]
#[command(name = "tilesr", about = "Tiled super-resolution image upscaler")]
struct Cli {
    #[arg(help = "Input image file(s)", required = true)]
    inputs: Vec<PathBuf>,

    #[arg(
        long,
        value_name = "LOCATOR",
        help = "Super-resolution ONNX model (path or http(s) URL)"
    )]
    model: String,

    #[arg(
        long = "face-model",
        value_name = "LOCATOR",
        help = "Optional face-restoration ONNX model"
    )]
    face_model: Option<String>,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "PATH",
        help = "Output file (single input) or directory"
    )]
    output: Option<PathBuf>,

    #[arg(long, help = "Model output magnification factor")]
    scale: Option<u32>,

    #[arg(long = "tile-size", help = "Source-side tile edge length in pixels")]
    tile_size: Option<u32>,

    #[arg(long, help = "Source-side overlap between adjacent tiles in pixels")]
    overlap: Option<u32>,

    #[arg(long = "input-name", help = "Model input tensor binding name")]
    input_name: Option<String>,

    #[arg(long = "output-name", help = "Model output tensor binding name")]
    output_name: Option<String>,

    #[arg(long, value_name = "FORMAT", help = "Output format: jpeg or png")]
    format: Option<String>,

    #[arg(long, help = "Output encoding quality in (0, 1]; JPEG only")]
    quality: Option<f32>,

    #[arg(long, value_name = "FILE", help = "TOML config file with pipeline defaults")]
    config: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long = "data-dir", help = "Directory for log files")]
    data_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();

    init_logging(
        cli.data_dir.as_deref(),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    let app_config = match &cli.config {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::default(),
    };

    let overrides = ConfigOverrides {
        scale: cli.scale,
        tile_size: cli.tile_size,
        overlap: cli.overlap,
        input_name: cli.input_name.clone(),
        output_name: cli.output_name.clone(),
        normalize: None,
        format: cli.format.as_deref().map(OutputFormat::from_str_lossy),
        quality: cli.quality,
    };

    let mut effective = app_config.pipeline.clone();
    overrides.apply_to(&mut effective);
    effective.validate()?;

    let mut worker = spawn_worker(app_config.pipeline, default_session_factory());
    worker
        .send(PipelineRequest::Init {
            options: overrides,
            model_paths: ModelPaths {
                realesrgan: cli.model.clone(),
                face_restore: cli.face_model.clone(),
            },
        })
        .await?;
    wait_for_ready(&mut worker).await?;

    let mut failures = 0usize;
    for (index, input) in cli.inputs.iter().enumerate() {
        let output_path = resolve_output_path(input, cli.output.as_deref(), cli.inputs.len(), effective.format)?;
        match upscale_one(&mut worker, index as u64, input, &output_path).await {
            Ok(()) => info!(input = %input.display(), output = %output_path.display(), "Image upscaled"),
            Err(error) => {
                tracing::error!(input = %input.display(), error = %format!("{error:#}"), "Image failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} image(s) failed", cli.inputs.len());
    }
    Ok(())
}

async fn wait_for_ready(worker: &mut WorkerHandle) -> Result<()> {
    loop {
        match worker.recv().await.context("pipeline worker exited")? {
            PipelineEvent::Ready => return Ok(()),
            PipelineEvent::Log { message } => info!("{message}"),
            PipelineEvent::Progress {
                percent, status, ..
            } => info!(percent, "{status}"),
            PipelineEvent::Error { message, .. } => bail!("initialization failed: {message}"),
            other => warn!(event = ?other, "Unexpected event before ready"),
        }
    }
}

async fn upscale_one(
    worker: &mut WorkerHandle,
    index: u64,
    input: &Path,
    output_path: &Path,
) -> Result<()> {
    let bytes = std::fs::read(input)
        .with_context(|| format!("failed to read input image: {}", input.display()))?;
    worker
        .send(PipelineRequest::Process {
            index,
            image: bytes,
        })
        .await?;

    loop {
        match worker.recv().await.context("pipeline worker exited")? {
            PipelineEvent::Progress {
                index: Some(i),
                percent,
                status,
            } if i == index => info!(percent, "{status}"),
            PipelineEvent::Log { message } => info!("{message}"),
            PipelineEvent::Result { index: i, image } if i == index => {
                std::fs::write(output_path, image).with_context(|| {
                    format!("failed to write output image: {}", output_path.display())
                })?;
                return Ok(());
            }
            PipelineEvent::Error {
                index: Some(i),
                message,
            } if i == index => bail!("{message}"),
            other => warn!(event = ?other, "Unexpected event"),
        }
    }
}

/// Default output is `<stem>_upscaled.<ext>` next to the input; `-o` names a
/// file for a single input or a directory otherwise.
fn resolve_output_path(
    input: &Path,
    output: Option<&Path>,
    input_count: usize,
    format: OutputFormat,
) -> Result<PathBuf> {
    let extension = match format {
        OutputFormat::Png => "png",
        OutputFormat::Jpeg => "jpg",
    };
    let stem = input
        .file_stem()
        .with_context(|| format!("input has no file name: {}", input.display()))?;
    let default_name = {
        let mut name = stem.to_os_string();
        name.push("_upscaled.");
        name.push(extension);
        name
    };

    match output {
        None => Ok(input.with_file_name(default_name)),
        Some(out) if input_count == 1 && !out.is_dir() => Ok(out.to_path_buf()),
        Some(dir) => Ok(dir.join(default_name)),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            if fallback.attempted_log_dir.is_some() {
                warn!(
                    attempted_log_dir = ?fallback.attempted_log_dir,
                    reason = %fallback.reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
