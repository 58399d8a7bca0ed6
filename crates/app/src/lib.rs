use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::backend::ExecutionDevice;
use tilescale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, UpscaleConfig};
use tilescale_core::engine::OrtEngine;
use tilescale_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use tilescale_core::media::{self, EncoderConfig, FrameDecoder, FrameEncoder};
use tilescale_core::model::{guess_scale, ModelCatalog, ModelDescriptor, DEFAULT_SCALE};
use tilescale_core::pipeline::{is_cancelled, OrtPipeline, UpscalePipeline};
use tilescale_core::runtime;
use tilescale_core::types::{Image, Video};

#[derive(Parser)]
#[command(name = "tilescale", about = "Tile-based neural upscaling for images and video")]
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
    /// Upscale a single image.
    Image(ImageArgs),
    /// Decode a whole video into memory, upscale it, then encode it.
    Video(VideoArgs),
    /// Upscale a video frame by frame without buffering it.
    Stream(VideoArgs),
    /// List known models.
    Models(ModelsArgs),
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    #[arg(short = 'm', long, help = "Catalog model name or path to an .onnx file")]
    model: String,
    #[arg(long, help = "Upscale factor (defaults to the catalog entry or the filename hint)")]
    scale: Option<u32>,
    #[arg(long, help = "Largest tile side fed to the model, 0 lets the model decide")]
    sample_size: Option<u32>,
    #[arg(long, help = "cpu, cuda or tensorrt")]
    device: Option<String>,
}

#[derive(Args)]
struct ImageArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[arg(short = 'i', long)]
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
}

#[derive(Args)]
struct VideoArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[arg(short = 'i', long)]
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long, help = "Stop after this many input frames")]
    max_frames: Option<u64>,
    #[arg(long, default_value = "libx264")]
    codec: String,
    #[arg(long, default_value_t = 18)]
    crf: i64,
    #[arg(long, help = "Do not copy audio and subtitle streams from the input")]
    no_passthrough: bool,
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, help = "Check SHA256 of every available model that has one")]
    verify: bool,
}

struct AppContext {
    data_dir: PathBuf,
    config: AppConfig,
    catalog: ModelCatalog,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = runtime::setup_runtime_libs();
    let config = load_config(&resolved_data_dir);
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    runtime::log_runtime_lib_status(&runtime_libs);
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let catalog = load_catalog(config.models_dir(&resolved_data_dir));
    let ctx = AppContext {
        data_dir: resolved_data_dir,
        config,
        catalog,
    };

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let result = match cli.command {
        Commands::Image(args) => run_image(&ctx, args, &cancel).await,
        Commands::Video(args) => run_video(&ctx, args, &cancel).await,
        Commands::Stream(args) => run_stream(&ctx, args, &cancel).await,
        Commands::Models(args) => list_models(&ctx.catalog, args.verify),
    };

    match result {
        Err(error) if is_cancelled(&error) => {
            eprintln!();
            warn!("Upscale cancelled by user");
            Ok(())
        }
        other => other,
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        eprintln!("Warning: failed to initialize data directory: {error:#}");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Warning: failed to load config file, using defaults: {error:#}");
            AppConfig::default()
        }
    }
}

fn load_catalog(models_dir: PathBuf) -> ModelCatalog {
    let mut catalog = ModelCatalog::with_builtin_models(models_dir);
    if let Err(error) = catalog.load_catalog_file() {
        warn!(error = %format!("{error:#}"), "Ignoring model catalog file");
    }
    if let Err(error) = catalog.discover() {
        warn!(error = %format!("{error:#}"), "Model discovery failed");
    }
    catalog
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current tile");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
fn select_log_filter(rust_log_env: Option<&str>, verbose: u8, cli_log_filter: Option<&str>) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        ..Default::default()
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention_files: usize) {
    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = ?fallback.attempted_log_dir,
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

/// Catalog entry or ad-hoc `.onnx` path, with command-line overrides applied.
fn resolve_model(
    catalog: &ModelCatalog,
    args: &ModelArgs,
    defaults: &UpscaleConfig,
) -> Result<(ModelDescriptor, PathBuf)> {
    let descriptor = match catalog.get(&args.model) {
        Some(entry) => entry.clone(),
        None => {
            let path = PathBuf::from(&args.model);
            if !path.is_file() {
                bail!(
                    "unknown model '{}': not in the catalog and not a file",
                    args.model
                );
            }
            let hint = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(guess_scale);
            ModelDescriptor::from_path(
                path,
                hint.unwrap_or(DEFAULT_SCALE),
                defaults.sample_size(),
                defaults.device,
            )
        }
    };

    let mut descriptor = match args.sample_size {
        Some(sample_size) => descriptor.with_sample_size((sample_size > 0).then_some(sample_size)),
        None => descriptor,
    }
    .with_device(match args.device.as_deref() {
        Some(device) => ExecutionDevice::from_str_lossy(device),
        None => defaults.device,
    });
    if let Some(scale) = args.scale {
        descriptor.scale = scale;
    }

    let model_path = catalog.resolve_path(&descriptor);
    Ok((descriptor, model_path))
}

async fn load_pipeline(ctx: &AppContext, args: &ModelArgs) -> Result<OrtPipeline> {
    let (descriptor, model_path) = resolve_model(&ctx.catalog, args, &ctx.config.upscale)?;
    if !model_path.is_file() {
        bail!("model file not found: {}", model_path.display());
    }
    info!(
        model = %descriptor.name,
        path = %model_path.display(),
        scale = descriptor.scale,
        device = %descriptor.device,
        "Using model"
    );

    let engine = OrtEngine::new(descriptor.clone(), model_path)
        .with_trt_cache_dir(ctx.config.trt_cache_dir(&ctx.data_dir))
        .with_iobinding(ctx.config.upscale.use_iobinding);
    let mut pipeline = UpscalePipeline::from_descriptor(descriptor, engine);
    pipeline.load().await?;
    Ok(pipeline)
}

async fn run_image(ctx: &AppContext, args: ImageArgs, cancel: &CancellationToken) -> Result<()> {
    let input_path = args.input.clone();
    let image = tokio::task::spawn_blocking(move || media::read_image(&input_path))
        .await
        .context("image decode task panicked")??;

    let mut pipeline = load_pipeline(ctx, &args.model).await?;
    let output = pipeline.run_image(&image, cancel).await?;
    pipeline.unload().await?;

    let output_path = args.output.clone();
    let (width, height) = (output.width(), output.height());
    tokio::task::spawn_blocking(move || media::write_image(&output_path, &output))
        .await
        .context("image encode task panicked")??;

    info!(
        output = %args.output.display(),
        width,
        height,
        "Image written"
    );
    Ok(())
}

fn encoder_config(args: &VideoArgs, width: usize, height: usize, fps: &str) -> EncoderConfig {
    let mut config = EncoderConfig::new(args.output.clone(), width as u32, height as u32, fps);
    config.codec = args.codec.clone();
    config.crf = args.crf;
    if args.no_passthrough {
        config
    } else {
        config.with_source(args.input.clone())
    }
}

async fn run_video(ctx: &AppContext, args: VideoArgs, cancel: &CancellationToken) -> Result<()> {
    let input_path = args.input.clone();
    let max_frames = args.max_frames;
    let (video, fps) = tokio::task::spawn_blocking(move || -> Result<(Video, String)> {
        let probe = media::probe(&input_path)?;
        let mut decoder = FrameDecoder::new(&input_path, &probe, max_frames)?;
        let frames = decoder.by_ref().collect::<Result<Vec<Image>>>()?;
        decoder.finish()?;
        Ok((Video::new(probe.video_info(), frames), probe.frame_rate_raw))
    })
    .await
    .context("video decode task panicked")??;
    info!(frames = video.len(), "Video decoded");

    let mut pipeline = load_pipeline(ctx, &args.model).await?;
    let output = pipeline.run_video(&video, cancel).await?;
    pipeline.unload().await?;
    drop(video);

    if output.is_empty() {
        warn!("Input produced no frames, nothing to encode");
        return Ok(());
    }

    let config = encoder_config(&args, output.info.width as usize, output.info.height as usize, &fps);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut encoder = FrameEncoder::new(&config)?;
        let total = output.len() as u64;
        let mut progress = Progress::new(Some(total));
        for frame in &output.frames {
            encoder.write_image(frame)?;
            progress.update(encoder.frames_written());
        }
        progress.finish();
        encoder.finish()
    })
    .await
    .context("video encode task panicked")??;

    info!(output = %args.output.display(), "Video written");
    Ok(())
}

async fn run_stream(ctx: &AppContext, args: VideoArgs, cancel: &CancellationToken) -> Result<()> {
    let probe = media::probe(&args.input)?;
    let expected_frames = match (probe.frame_count, args.max_frames) {
        (Some(count), Some(max)) => Some(count.min(max)),
        (count, max) => count.or(max),
    };

    let (tx, rx) = mpsc::channel::<Result<Image>>(1);
    let input_path = args.input.clone();
    let decode_probe = probe.clone();
    let max_frames = args.max_frames;
    let decoder_task = tokio::task::spawn_blocking(move || {
        let mut decoder = match FrameDecoder::new(&input_path, &decode_probe, max_frames) {
            Ok(decoder) => decoder,
            Err(error) => {
                let _ = tx.blocking_send(Err(error));
                return;
            }
        };
        for frame in decoder.by_ref() {
            if tx.blocking_send(frame).is_err() {
                return;
            }
        }
        if let Err(error) = decoder.finish() {
            let _ = tx.blocking_send(Err(error));
        }
    });

    let mut pipeline = load_pipeline(ctx, &args.model).await?;
    let mut encoder: Option<(mpsc::Sender<Image>, JoinHandle<Result<u64>>)> = None;
    let mut sent = 0u64;
    let mut progress = Progress::new(expected_frames);
    {
        let mut stream = pipeline.run_stream(rx, cancel.clone())?;
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            let (width, height) = (frame.width(), frame.height());
            let (frames_tx, _) = encoder.get_or_insert_with(|| {
                spawn_encoder(encoder_config(&args, width, height, &probe.frame_rate_raw))
            });
            // A closed channel means the encoder failed; its error surfaces on join.
            if frames_tx.send(frame).await.is_err() {
                break;
            }
            sent += 1;
            progress.update(sent);
        }
    }
    progress.finish();
    pipeline.unload().await?;
    decoder_task.await.context("decoder task panicked")?;

    match encoder {
        Some((frames_tx, encoder_task)) => {
            drop(frames_tx);
            let written = encoder_task.await.context("encoder task panicked")??;
            info!(output = %args.output.display(), frames = written, "Video written");
        }
        None => warn!("Input produced no frames, nothing to encode"),
    }
    Ok(())
}

/// Runs a [`FrameEncoder`] on a blocking thread fed through a bounded channel,
/// so ffmpeg's stdin writes never stall a runtime worker.
fn spawn_encoder(config: EncoderConfig) -> (mpsc::Sender<Image>, JoinHandle<Result<u64>>) {
    let (tx, mut rx) = mpsc::channel::<Image>(1);
    let task = tokio::task::spawn_blocking(move || {
        let mut encoder = FrameEncoder::new(&config)?;
        while let Some(frame) = rx.blocking_recv() {
            encoder.write_image(&frame)?;
        }
        let written = encoder.frames_written();
        encoder.finish()?;
        Ok(written)
    });
    (tx, task)
}

fn list_models(catalog: &ModelCatalog, verify: bool) -> Result<()> {
    println!("Models directory: {}", catalog.models_dir().display());
    for entry in catalog.list() {
        let available = catalog.is_available(&entry.name);
        let sample = entry
            .sample_size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "any".to_string());
        println!(
            "  {:<36} x{}  tile {:<5} {:<14} {}{}",
            entry.name,
            entry.scale,
            sample,
            entry.normalization.to_string(),
            if available { "available" } else { "missing" },
            if entry.is_fp16 { " (fp16)" } else { "" },
        );
        if verify && available {
            catalog.verify(&entry.name)?;
        }
    }
    Ok(())
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_FRAMES: u64 = 2;

struct Progress {
    total: Option<u64>,
    started: Instant,
    fps_started: Option<Instant>,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        Self {
            total,
            started: Instant::now(),
            fps_started: None,
        }
    }

    fn update(&mut self, done: u64) {
        if self.fps_started.is_none() && done > FPS_WARMUP_FRAMES {
            self.fps_started = Some(Instant::now());
        }
        let fps_elapsed = self
            .fps_started
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let fps = compute_fps(done, fps_elapsed);
        let elapsed = format_duration(self.started.elapsed().as_secs_f64());

        match self.total {
            Some(total) if total > 0 => {
                let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
                let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
                let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH - filled);
                let eta = if fps > 0.0 {
                    format!(
                        " | ETA: {}",
                        format_duration(total.saturating_sub(done) as f64 / fps)
                    )
                } else {
                    String::new()
                };
                eprint!(
                    "\r[{bar}] {:5.1}% | Frame {done}/{total} | {fps:.1} fps | Elapsed: {elapsed}{eta}    ",
                    fraction * 100.0
                );
            }
            _ => eprint!("\rFrame {done} | {fps:.1} fps | Elapsed: {elapsed}    "),
        }
    }

    fn finish(&self) {
        eprintln!();
    }
}

fn compute_fps(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }
    (done - FPS_WARMUP_FRAMES) as f64 / elapsed
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn parses_stream_command_with_model_overrides() {
        let cli = Cli::try_parse_from([
            "tilescale",
            "-vv",
            "stream",
            "--model",
            "RealESRGAN_x4plus_anime_6B",
            "-i",
            "in.mkv",
            "-o",
            "out.mkv",
            "--sample-size",
            "128",
            "--device",
            "trt",
            "--max-frames",
            "10",
        ])
        .expect("parse");

        assert_eq!(cli.verbose, 2);
        let Commands::Stream(args) = cli.command else {
            panic!("expected stream command");
        };
        assert_eq!(args.model.model, "RealESRGAN_x4plus_anime_6B");
        assert_eq!(args.model.sample_size, Some(128));
        assert_eq!(args.max_frames, Some(10));
        assert_eq!(args.codec, "libx264");
        assert_eq!(args.crf, 18);
        assert!(!args.no_passthrough);
    }

    #[test]
    fn image_command_requires_input_and_output() {
        assert!(Cli::try_parse_from(["tilescale", "image", "--model", "m"]).is_err());
        assert!(Cli::try_parse_from([
            "tilescale", "image", "--model", "m", "-i", "a.png", "-o", "b.png"
        ])
        .is_ok());
    }
}
