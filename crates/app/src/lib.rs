use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framedouble_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use framedouble_core::engine::serve_engine;
use framedouble_core::error::{classify, PipelineError};
use framedouble_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use framedouble_core::pipeline::{self, RunRequest};
use framedouble_core::probe;
use framedouble_core::scheduler::ProgressCallback;

/// Process exit code for a cancelled run (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "framedouble",
    version,
    about = "Double the frame rate of a video with an external interpolation engine",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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

    #[arg(long, global = true, help = "Data directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,

    #[arg(value_name = "INPUT", help = "Shorthand for `run INPUT...` with configured defaults")]
    inputs: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interpolate one or more videos to twice their frame rate.
    Run(RunArgs),
    /// Print the probed stream metadata as JSON.
    Probe {
        input: PathBuf,
    },
    /// Stand-in engine: answers every request with the left frame.
    #[command(hide = true)]
    IdentityEngine,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(value_name = "INPUT", required = true, help = "Input video files, processed in order")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long, help = "Output path (single input only)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Number of engine instances run in parallel")]
    workers: Option<usize>,
    #[arg(long, value_name = "PROGRAM", help = "Interpolation engine binary")]
    engine: Option<PathBuf>,
    #[arg(
        long = "engine-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Extra engine argument (repeatable, replaces configured args)"
    )]
    engine_args: Vec<String>,
    #[arg(long, value_name = "SECS", help = "Per-request engine deadline, 0 disables")]
    request_timeout: Option<u64>,
    #[arg(long, help = "Output video codec")]
    codec: Option<String>,
    #[arg(long, help = "Output constant rate factor")]
    crf: Option<u32>,
    #[arg(long, help = "Do not copy the source audio stream")]
    no_audio: bool,
}

/// 1 for every failure except cancellation.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match classify(error) {
        Some(PipelineError::Cancelled) => EXIT_CANCELLED,
        _ => 1,
    }
}

/// Failure category for the final error log; `internal` when unclassified.
pub fn error_kind(error: &anyhow::Error) -> &'static str {
    classify(error).map_or("internal", PipelineError::kind)
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let data_dir_arg = cli.data_dir.as_deref();
    let log_filter = cli.log_filter.as_deref();

    match cli.command {
        // stdout and stderr belong to the protocol and the parent's log drain.
        Some(Commands::IdentityEngine) => run_identity_engine(),
        Some(Commands::Run(args)) => {
            let resolved_data_dir = start_logging(data_dir_arg, cli.verbose, log_filter);
            run_videos(args, &resolved_data_dir).await
        }
        Some(Commands::Probe { input }) => {
            start_logging(data_dir_arg, cli.verbose, log_filter);
            probe_video(&input)
        }
        None if !cli.inputs.is_empty() => {
            let resolved_data_dir = start_logging(data_dir_arg, cli.verbose, log_filter);
            let args = RunArgs {
                inputs: cli.inputs,
                ..Default::default()
            };
            run_videos(args, &resolved_data_dir).await
        }
        None => {
            Cli::command()
                .print_help()
                .context("failed to print help")?;
            Ok(())
        }
    }
}

/// Resolve the data dir and install the subscriber; returns the data dir.
fn start_logging(data_dir_arg: Option<&Path>, verbose: u8, log_filter: Option<&str>) -> PathBuf {
    let resolved_data_dir = data_dir(data_dir_arg);
    init_logging(Some(resolved_data_dir.as_path()), verbose, log_filter);
    log_startup_metadata(&resolved_data_dir);
    resolved_data_dir
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
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

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

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
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

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    AppConfig::load_from_path(&config_path(data_dir))
}

fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    if let Some(engine) = &args.engine {
        config.engine.program = engine.clone();
    }
    if !args.engine_args.is_empty() {
        config.engine.args = args.engine_args.clone();
    }
    if let Some(secs) = args.request_timeout {
        config.engine.request_timeout_secs = secs;
    }
    if let Some(codec) = &args.codec {
        config.encoder.codec = codec.clone();
    }
    if let Some(crf) = args.crf {
        config.encoder.crf = crf;
    }
    if args.no_audio {
        config.encoder.copy_audio = false;
    }
}

fn validate_run_args(args: &RunArgs) -> Result<()> {
    if args.output.is_some() && args.inputs.len() > 1 {
        return Err(PipelineError::Configuration(format!(
            "--output names a single file but {} inputs were given",
            args.inputs.len()
        ))
        .into());
    }
    Ok(())
}

/// Ctrl-C flips the returned receiver to `true`.
fn spawn_ctrl_c_watcher() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });
    cancel_rx
}

async fn run_videos(args: RunArgs, data_dir: &Path) -> Result<()> {
    validate_run_args(&args)?;
    let mut config = load_config(data_dir)?;
    apply_overrides(&mut config, &args);
    framedouble_core::runtime::log_tool_status(&config.engine.program.to_string_lossy());

    let cancel = spawn_ctrl_c_watcher();
    let total = args.inputs.len();

    for (index, input) in args.inputs.iter().enumerate() {
        let input = std::path::absolute(input)
            .with_context(|| format!("failed to resolve input path {}", input.display()))?;
        info!(
            input = %input.display(),
            file = index + 1,
            files = total,
            "Processing video file"
        );

        let request = RunRequest {
            input: input.clone(),
            output: args.output.clone(),
            config: config.clone(),
        };
        let result = pipeline::run(request, cancel.clone(), Some(make_progress_callback())).await;
        eprintln!();

        let summary = result.with_context(|| format!("failed to process {}", input.display()))?;
        info!(
            output = %summary.output.display(),
            frames = summary.frames_written,
            fps = %summary.output_frame_rate,
            elapsed = %format_duration(summary.elapsed.as_secs_f64()),
            "Video file done"
        );
    }

    Ok(())
}

fn probe_video(input: &Path) -> Result<()> {
    let metadata = probe::probe(input)?;
    let json = serde_json::to_string_pretty(&metadata).context("failed to serialize metadata")?;
    println!("{json}");
    Ok(())
}

fn run_identity_engine() -> Result<()> {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    let result = serve_engine(BufReader::new(stdin), BufWriter::new(stdout), |left, _right| {
        Ok(left.clone())
    });
    if let Err(error) = &result {
        let _ = writeln!(io::stderr(), "identity engine failed: {error:#}");
    }
    result.map(|_| ())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
/// Frames the speed estimate is averaged over.
const PROGRESS_WINDOW: usize = 12;

/// Output frames per second over a sliding window of recent frames.
struct ProgressMeter {
    window: VecDeque<Instant>,
    capacity: usize,
}

impl ProgressMeter {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(2),
        }
    }

    /// Record one frame at `now`; `None` until the window has filled.
    fn tick(&mut self, now: Instant) -> Option<f64> {
        self.window.push_back(now);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        if self.window.len() < self.capacity {
            return None;
        }
        let elapsed = now.duration_since(*self.window.front()?).as_secs_f64();
        (elapsed > 0.0).then(|| (self.capacity - 1) as f64 / elapsed)
    }
}

fn render_progress(written: u64, total: u64, speed: Option<f64>, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (written as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let (fps, eta) = match speed {
        Some(speed) => (
            format!("{speed:4.1}"),
            format_duration(total.saturating_sub(written) as f64 / speed),
        ),
        None => ("--.-".to_string(), "--:--:--".to_string()),
    };

    format!(
        "[{}] {:7.3}% | Frame {}/{} | {} fps | Elapsed: {} | ETA: {}",
        bar,
        fraction * 100.0,
        written,
        total,
        fps,
        format_duration(elapsed),
        eta,
    )
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let meter = Mutex::new(ProgressMeter::new(PROGRESS_WINDOW));
    Box::new(move |written, total| {
        let now = Instant::now();
        let speed = meter.lock().unwrap_or_else(|p| p.into_inner()).tick(now);
        let line = render_progress(written, total, speed, now.duration_since(start).as_secs_f64());
        eprint!("\r{line}    ");
    })
}
