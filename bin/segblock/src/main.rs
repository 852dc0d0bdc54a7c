#![deny(unsafe_code)]

//! Replicator front end: parses the CLI surface, selects a run-mode, and
//! drives the engine. Thin by design — the only logic here is flag
//! parsing, mode selection, and reporting; everything else lives in
//! `engine`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use engine::{EngineError, RunConfig, RunMode, RunOutcome};

/// Incremental block-level replication between a source and a target.
#[derive(Parser, Debug)]
#[command(name = "segblock", version, about)]
struct Args {
    /// Source device or file.
    #[arg(short = 's', long = "source")]
    source: PathBuf,

    /// Target device or file.
    #[arg(short = 't', long = "target")]
    target: Option<PathBuf>,

    /// Checksum store path, or "/dev/null" for no-store mode.
    #[arg(short = 'c', long = "checksum")]
    checksum: Option<PathBuf>,

    /// Change-map file driving a ddmap-restricted run.
    #[arg(short = 'm', long = "changemap")]
    changemap: Option<PathBuf>,

    /// Delta output path; selects SOURCE_DELTA.
    #[arg(short = 'x', long = "delta")]
    delta: Option<PathBuf>,

    /// Worker thread count.
    #[arg(short = 'w', long = "workers", default_value_t = 1)]
    workers: usize,

    /// Bypass the page cache on the source read path where supported.
    #[arg(short = 'd', long = "direct")]
    cache_bypass: bool,

    /// DDZONE per-worker throughput cap in MB/s.
    #[arg(short = 'r', long = "rate")]
    rate: Option<u64>,

    /// Preflight: exit 3 if the checksum store would need rebuilding.
    #[arg(short = 'b', long = "preflight")]
    preflight: bool,

    /// Compress delta region payloads.
    #[arg(short = 'z', long = "compress")]
    compress: bool,

    /// Compression level, 1 (fastest) to 9 (smallest).
    #[arg(short = 'l', long = "level", default_value_t = 6)]
    level: u8,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print compiled-in build parameters and exit.
    #[arg(short = 'p', long = "parameters")]
    parameters: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(logging::Verbosity::from_count(args.verbose));

    if args.parameters {
        print_parameters();
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            println!("segblock: {err}");
            ExitCode::FAILURE
        }
    }
}

fn print_parameters() {
    println!("segment_size={}", layout::SEGMENT_SIZE);
    println!("buffer_size={}", layout::BUFFER_SIZE);
    println!("segments_per_buffer={}", layout::SEGMENTS_PER_BUFFER);
    println!("version={}", env!("CARGO_PKG_VERSION"));
}

fn run(args: &Args) -> Result<ExitCode, EngineError> {
    let level = compress::CompressionLevel::new(args.level)
        .unwrap_or(compress::CompressionLevel::DEFAULT);

    let checksum = args
        .checksum
        .clone()
        .unwrap_or_else(|| PathBuf::from(store::NO_STORE_SINK));

    let (mode, workers) = select_mode(args);

    let config = RunConfig {
        mode,
        source: args.source.clone(),
        target: args.target.clone(),
        checksum: checksum.clone(),
        changemap: args.changemap.clone(),
        delta: args.delta.clone(),
        workers,
        cache_bypass: args.cache_bypass,
        throttle_mb_s: args.rate,
        compress: args.compress,
        level,
    };

    match engine::run(&config)? {
        RunOutcome::PreflightNewStoreRequired => Ok(ExitCode::from(3)),
        RunOutcome::Completed(stats) => {
            if matches!(mode, RunMode::SourceTarget | RunMode::SourceDelta)
                && checksum.as_path() != std::path::Path::new(store::NO_STORE_SINK)
            {
                let line = stats.sidecar_line(
                    time::OffsetDateTime::now_utc(),
                );
                let _ = engine::append_sidecar(&checksum, &line);
            }
            tracing::info!(
                changed = stats.totals.changed_segments,
                written = stats.totals.bytes_written,
                "run complete"
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Implements the mode-selection table from the CLI surface: which flags
/// are present determines the run-mode, with a couple of silent
/// overrides (SOURCE_DELTA and, absent `-w`, DDZONE force one worker).
fn select_mode(args: &Args) -> (RunMode, usize) {
    if args.delta.is_some() {
        return (RunMode::SourceDelta, 1);
    }
    if args.target.is_some() {
        let mode = if args.preflight { RunMode::NewChecksum } else { RunMode::SourceTarget };
        return (mode, args.workers);
    }
    if args.checksum.is_some() {
        return (RunMode::ChecksumOnly, args.workers);
    }
    let workers = if args.workers > 1 { args.workers } else { 1 };
    (RunMode::DdZone, workers)
}
