//! The single immutable configuration value threaded through the engine in
//! place of process-wide globals (see the design note on process-wide
//! configuration): built once by the CLI layer, then passed by reference
//! into the driver, which borrows the fields each worker needs into its
//! `thread::scope` closures.

use std::path::PathBuf;

use compress::CompressionLevel;

/// The top-level operation selector. Fixed for the run's duration once
/// chosen at entry; no sub-states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunMode {
    /// Replicate changed segments from source to target.
    SourceTarget,
    /// Rebuild the checksum store from source without writing a target.
    ChecksumOnly,
    /// Preflight: exit 3 if the store would need to be rebuilt.
    NewChecksum,
    /// Read-only throughput profiling.
    DdZone,
    /// Emit a delta file of changed regions.
    SourceDelta,
}

/// Configuration for one `SOURCE_TARGET` / `CHECKSUM_ONLY` / `SOURCE_DELTA`
/// / `DDZONE` run, built once from parsed CLI arguments.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Run-mode selector.
    pub mode: RunMode,
    /// Source device or file path.
    pub source: PathBuf,
    /// Target device or file path (`SOURCE_TARGET` only).
    pub target: Option<PathBuf>,
    /// Checksum store path, or the `/dev/null` no-store sink.
    pub checksum: PathBuf,
    /// Change-map path, selecting the ddmap-driven worker when present.
    pub changemap: Option<PathBuf>,
    /// Delta output path (`SOURCE_DELTA` only).
    pub delta: Option<PathBuf>,
    /// Requested worker count before any silent reductions.
    pub workers: usize,
    /// Whether the source read path requests cache-bypass I/O.
    pub cache_bypass: bool,
    /// DDZONE per-worker throughput cap in MB/s, if throttling.
    pub throttle_mb_s: Option<u64>,
    /// Whether `SOURCE_DELTA` regions are zlib-compressed.
    pub compress: bool,
    /// Compression level when `compress` is set.
    pub level: CompressionLevel,
}

impl RunConfig {
    /// Applies the mode-selection silent adjustments described in the
    /// worker pipeline spec: `SOURCE_DELTA` forces a single writer, and a
    /// requested worker count that would make every worker's partition
    /// smaller than one read buffer is reduced to one worker.
    #[must_use]
    pub fn effective_workers(&self, source_bytes: u64) -> usize {
        if matches!(self.mode, RunMode::SourceDelta) {
            return 1;
        }
        let requested = self.workers.max(1);
        if requested as u64 * layout::BUFFER_SIZE > source_bytes {
            1
        } else {
            requested
        }
    }
}
