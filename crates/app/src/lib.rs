use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upchunk_core::backend::InferenceBackend;
use upchunk_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use upchunk_core::image_io::{tensor_to_png16, ImageCodec, ImageCrateCodec, OutputFormat};
use upchunk_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use upchunk_core::model_registry::ModelRegistry;
use upchunk_core::ort_engine::OrtEngine;
use upchunk_core::pipeline::{UpscaleInput, UpscaleOptions, UpscaleOutput, Upscaler};
use upchunk_core::slicer::ChunkLevel;
use upchunk_core::{Model, PipelineError};

#[derive(Parser)]
#[command(name = "upchunk", about = "Chunked neural image upscaling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale one image file.
    Upscale(UpscaleArgs),
    /// List models found under the models directory.
    Models(ModelsArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image file")]
    input: PathBuf,
    #[arg(short = 'm', long, help = "Registered model name or path to an .onnx file")]
    model: String,
    #[arg(short = 'o', long, help = "Output file (defaults to <input>-upscaled.<format>)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Square tile size; switches to tiled slicing")]
    tile_size: Option<usize>,
    #[arg(long, value_name = "1-4", help = "Chunk size level")]
    chunk_level: Option<u8>,
    #[arg(long, help = "cpu, cuda or tensorrt")]
    backend: Option<InferenceBackend>,
    #[arg(long, help = "Run inference on the calling task instead of a worker")]
    in_process: bool,
    #[arg(long, help = "Do not carry the input alpha channel over to the output")]
    no_alpha: bool,
    #[arg(long, help = "png, jpeg or webp")]
    format: Option<OutputFormat>,
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    quality: Option<u8>,
    #[arg(long, help = "Write a 16-bit PNG from the assembled float tensor")]
    png16: bool,
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, help = "Print the list as JSON")]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(Some(resolved_data_dir.as_path()), cli.verbose, cli.log_filter.as_deref());
    initialize_data_dir(&resolved_data_dir)?;

    let cfg_path = config_path(&resolved_data_dir);
    let config = AppConfig::load_from_path(&cfg_path)?;
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    let models_dir = resolve_relative_to(&resolved_data_dir, &config.paths.models_dir);
    let mut registry = ModelRegistry::new(models_dir);
    registry.discover()?;

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, &config, &resolved_data_dir, &registry).await,
        Commands::Models(args) => list_models(&registry, args.json),
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
    let filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
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

fn list_models(registry: &ModelRegistry, json: bool) -> Result<()> {
    if json {
        println!("{}", registry.to_json()?);
        return Ok(());
    }

    if registry.list().is_empty() {
        println!("No models found under {}", registry.models_dir().display());
        return Ok(());
    }
    for entry in registry.list() {
        println!(
            "{:<32} {:>2}ch {:<8} {}  {}",
            entry.name,
            entry.channel,
            entry.data_type,
            entry.layout,
            entry.relative_path
        );
    }
    Ok(())
}

/// Merge CLI overrides into the configured run options.
fn upscale_options(args: &UpscaleArgs, config: &AppConfig) -> UpscaleOptions {
    let mut options = config.inference.upscale_options();
    if let Some(level) = args.chunk_level {
        options.chunk_level = ChunkLevel::from_level(level);
    }
    if args.in_process {
        options.strategy = upchunk_core::DispatchStrategy::InProcess;
    }
    if args.no_alpha {
        options.preserve_alpha = false;
    }
    options
}

/// Output format: explicit flag, then the output file extension, then config.
fn output_format(args: &UpscaleArgs, config: &AppConfig) -> OutputFormat {
    if args.png16 {
        return OutputFormat::Png;
    }
    args.format
        .or_else(|| args.output.as_deref().and_then(OutputFormat::from_extension))
        .unwrap_or(config.output.format)
}

fn default_output_path(input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}-upscaled.{}", format.extension()))
}

async fn run_upscale(
    args: UpscaleArgs,
    config: &AppConfig,
    data_dir: &Path,
    registry: &ModelRegistry,
) -> Result<()> {
    if !args.input.exists() {
        bail!("Input file does not exist: {}", args.input.display());
    }

    let model = registry.resolve(&args.model)?.with_tile_size(args.tile_size);
    let options = upscale_options(&args, config);
    let format = output_format(&args, config);
    let quality = args.quality.unwrap_or(config.output.quality);
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input, format));

    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read input image: {}", args.input.display()))?;

    let backend = args.backend.unwrap_or(config.inference.backend);
    let trt_cache_dir = resolve_relative_to(data_dir, &config.inference.trt_cache_dir);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current chunk");
            let _ = cancel_tx.send(true);
        }
    });

    info!(
        input = %args.input.display(),
        model = %model.name,
        backend = %backend,
        tile_size = ?model.tile_size,
        chunk_level = options.chunk_level.level(),
        "Upscaling"
    );

    let engine = OrtEngine::new(backend).with_trt_cache_dir(Some(trt_cache_dir.clone()));
    let result = upscale_once(engine, options, &model, bytes.clone(), &cancel_rx).await;

    let output = match result {
        Err(e) if e.is_gpu_error() && backend.uses_gpu() => {
            warn!(error = %e, "GPU failure; retrying on CPU");
            let engine = OrtEngine::new(InferenceBackend::Cpu);
            upscale_once(engine, options, &model, bytes, &cancel_rx).await?
        }
        other => other?,
    };

    let encoded = if args.png16 {
        let tensor = output
            .tensor
            .as_ref()
            .zip(output.tensor_dims)
            .context("16-bit export needs an assembled tensor; tiled runs do not keep one")?;
        tensor_to_png16(tensor.0, tensor.1, output.layout)?
    } else {
        ImageCrateCodec.encode(&output.image, quality, format)?
    };

    std::fs::write(&output_path, &encoded)
        .with_context(|| format!("Failed to write output image: {}", output_path.display()))?;

    info!(
        output = %output_path.display(),
        width = output.image.width,
        height = output.image.height,
        multiplier = output.multiplier,
        elapsed_secs = format!("{:.2}", output.elapsed.as_secs_f64()),
        "Upscale written"
    );

    Ok(())
}

async fn upscale_once(
    engine: OrtEngine,
    options: UpscaleOptions,
    model: &Model,
    bytes: Vec<u8>,
    cancel: &watch::Receiver<bool>,
) -> Result<UpscaleOutput, PipelineError> {
    let mut upscaler = Upscaler::new(engine, options);
    upscaler
        .upscale(UpscaleInput::File(bytes), model, Some(cancel))
        .await
}
