mod backoff;
mod batch;
mod config;
mod error;
mod replay;
mod sim;

use anyhow::{Context, Result};
use clap::{Args as CliArgs, Parser, Subcommand};
use colored::Colorize;
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use backoff::{BackoffKind, BackoffPolicy};
use batch::{BatchOrchestrator, OutcomeStore, load_dataset, report};
use config::{BatchConfig, HarnessConfig, QualityLevel, RenderMode, ServerConfig, SessionConfig};
use replay::LogDecoder;
use sim::{ConnectionManager, ServerLifecycle};

#[derive(Debug, Parser)]
#[command(name = "simharness", version = "0.3.0")]
#[command(
    about = "Batch scenario harness for a simulator server - supervised runs, resumable outcomes, recording decode"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a scenario dataset against a supervised simulator server
    Run(RunArgs),
    /// Decode a binary recording log into CSV
    Decode(DecodeArgs),
}

#[derive(Debug, CliArgs)]
struct RunArgs {
    /// Scenario dataset (JSON array of descriptors)
    dataset: PathBuf,

    /// Append-only outcome store; also the resume source
    #[arg(long, default_value = "outcomes.jsonl")]
    outcomes: PathBuf,

    /// Re-run scenarios that already have a successful outcome
    #[arg(long)]
    no_resume: bool,

    /// Server restarts tolerated across the batch before aborting
    #[arg(long, default_value_t = 3)]
    restart_ceiling: u32,

    /// Frame budget for descriptors that do not carry their own
    #[arg(long, default_value_t = 18_000)]
    timeout_frames: u64,

    /// Simulation rate; fixed delta is 1/fps
    #[arg(long, default_value_t = 100.0)]
    fps: f64,

    /// Simulator RPC host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Simulator RPC port
    #[arg(long, default_value_t = 2000)]
    port: u16,

    /// Simulator server launch script
    #[arg(long, default_value = "CarlaUE4.sh")]
    server_binary: PathBuf,

    #[arg(long, value_enum, default_value_t = RenderMode::Offscreen)]
    render: RenderMode,

    #[arg(long, value_enum, default_value_t = QualityLevel::Low)]
    quality: QualityLevel,

    /// Directory for per-scenario recording logs
    #[arg(long, default_value = "recordings")]
    recording_dir: PathBuf,

    /// Connection attempts per scenario before giving up
    #[arg(long, default_value_t = 3)]
    connect_retries: u32,

    /// Delay shape between failed connection attempts
    #[arg(long, value_enum, default_value_t = BackoffKind::Exponential)]
    backoff: BackoffKind,
}

#[derive(Debug, CliArgs)]
struct DecodeArgs {
    /// Recording log to decode
    log: PathBuf,

    /// Write CSV here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Restrict output to one actor id
    #[arg(long)]
    actor: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run_batch(args).await,
        Command::Decode(args) => decode_log(&args),
    }
}

async fn run_batch(args: RunArgs) -> Result<()> {
    announce_banner();

    let config = build_config(&args);
    let dataset = load_dataset(&args.dataset)?;
    println!(
        "📋 {} scenarios from {}",
        dataset.len(),
        args.dataset.display()
    );

    let store = OutcomeStore::open(&config.batch.outcomes)?;
    let stop = Arc::new(AtomicBool::new(false));
    spawn_stop_handler(stop.clone());

    let manager = ConnectionManager::new(&config.server.host, config.server.port, &config.session);
    let supervisor = ServerLifecycle::new(config.server.clone());

    let start = Instant::now();
    let mut orchestrator =
        BatchOrchestrator::new(Box::new(supervisor), manager, config, store, stop);
    let summary = orchestrator.run(&dataset).await?;

    report::print_summary(&summary, start.elapsed());
    if !summary.completed_fully() {
        std::process::exit(1);
    }
    Ok(())
}

fn decode_log(args: &DecodeArgs) -> Result<()> {
    let decoder = LogDecoder::open(&args.log)
        .with_context(|| format!("opening recording {}", args.log.display()))?;
    let mut target = OutputTarget::new(args.output.clone())?;
    let rows = replay::write_csv(decoder, &mut target, args.actor)
        .with_context(|| format!("decoding {}", args.log.display()))?;
    target.flush_inner()?;
    info!("decoded {rows} rows from {}", args.log.display());
    Ok(())
}

fn build_config(args: &RunArgs) -> HarnessConfig {
    let connect_backoff = match args.backoff {
        BackoffKind::Fixed => BackoffPolicy::fixed(Duration::from_secs(1)),
        BackoffKind::Exponential => BackoffPolicy::default(),
    };
    HarnessConfig {
        server: ServerConfig {
            binary: args.server_binary.clone(),
            host: args.host.clone(),
            port: args.port,
            render: args.render,
            quality: args.quality,
            ..ServerConfig::default()
        },
        session: SessionConfig {
            connect_retries: args.connect_retries,
            connect_backoff,
            ..SessionConfig::with_fps(args.fps)
        },
        run: config::RunPolicy {
            default_timeout_frames: args.timeout_frames,
            ..config::RunPolicy::default()
        },
        batch: BatchConfig {
            dataset: args.dataset.clone(),
            outcomes: args.outcomes.clone(),
            recording_dir: args.recording_dir.clone(),
            resume: !args.no_resume,
            restart_ceiling: args.restart_ceiling,
        },
    }
}

fn spawn_stop_handler(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{}",
                "🛑 Stop requested, finishing the current scenario".yellow()
            );
            stop.store(true, Ordering::SeqCst);
        }
    });
}

fn announce_banner() {
    println!("{}", "🚗 Simulation Batch Harness".bright_cyan().bold());
    println!("{}", "================================".cyan());
}

enum OutputTarget {
    Stdout(BufWriter<std::io::Stdout>),
    File(BufWriter<File>),
}

impl OutputTarget {
    fn new(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Self::File(BufWriter::new(file)))
        } else {
            Ok(Self::Stdout(BufWriter::new(stdout())))
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stdout(w) => w,
            Self::File(w) => w,
        }
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout(w) => w.flush(),
            Self::File(w) => w.flush(),
        }
    }
}

impl Write for OutputTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_inner()
    }
}
