//! Partitions a source across workers, spawns them, and aggregates the
//! result. This is the only place that touches [`std::thread::scope`];
//! every worker gets its own independent file descriptors and an
//! exclusive checksum-store slice, so no locking crosses thread
//! boundaries.

use std::path::Path;
use std::time::{Duration, Instant};

use device_io::CacheMode;
use layout::{BUFFER_SIZE, SEGMENT_SIZE};
use store::ChecksumStore;

use crate::config::{RunConfig, RunMode};
use crate::error::EngineError;
use crate::stats::{RunStats, WorkerStats};
use crate::worker::{BufferWindow, WorkerInput, run_worker};

/// Delay between successive worker thread starts, to avoid every reader
/// hitting the same region of spinning media at once.
const THREAD_STAGGER: Duration = Duration::from_micros(500);

/// What a run produced: either it ran to completion, or (`NEW_CHECKSUM`
/// only) it determined the store would need rebuilding and stopped
/// before touching the source.
pub enum RunOutcome {
    /// The run executed and produced aggregated statistics.
    Completed(RunStats),
    /// `NEW_CHECKSUM` preflight: the checksum store is absent or the
    /// wrong size. Callers should exit 3 without copying.
    PreflightNewStoreRequired,
}

/// Executes one run according to `config`.
pub fn run(config: &RunConfig) -> Result<RunOutcome, EngineError> {
    let mut source_handle = device_io::open_read_only(&config.source, CacheMode::Buffered)?;
    let source_len = device_io::size_in_bytes(&mut source_handle)?;
    drop(source_handle);

    if config.mode == RunMode::NewChecksum {
        let expected_len = layout::expected_store_len(source_len);
        let existing_len = std::fs::metadata(&config.checksum).ok().map(|m| m.len());
        return Ok(if existing_len == Some(expected_len) {
            RunOutcome::Completed(RunStats {
                totals: WorkerStats::default(),
                elapsed: Duration::ZERO,
            })
        } else {
            RunOutcome::PreflightNewStoreRequired
        });
    }

    if config.mode == RunMode::ChecksumOnly
        && config.checksum.as_path() != Path::new(store::NO_STORE_SINK)
    {
        // CHECKSUM_ONLY always rebuilds from scratch.
        let _ = std::fs::remove_file(&config.checksum);
    }

    if config.mode == RunMode::SourceTarget {
        let target_path = config.target.as_deref().expect("SOURCE_TARGET requires a target path");
        prepare_target(target_path, source_len)?;
    }

    let started = Instant::now();

    let changemap = config
        .changemap
        .as_deref()
        .map(changemap::ChangeMap::open)
        .transpose()?;

    let workers = config.effective_workers(source_len);
    let partitions = partition_ranges(source_len, workers);

    let mut store = if config.mode == RunMode::DdZone {
        ChecksumStore::open_or_create(Path::new(store::NO_STORE_SINK), source_len)?
    } else {
        ChecksumStore::open_or_create(&config.checksum, source_len)?
    };

    let entry_counts: Vec<u64> = partitions
        .iter()
        .map(|range| layout::segment_count(range.end) - layout::segment_count(range.start))
        .collect();
    let mut store_partitions = store.partition_mut(&entry_counts);

    let mut delta_writer = if config.mode == RunMode::SourceDelta {
        Some(delta::DeltaWriter::create(
            config.delta.as_deref().expect("SOURCE_DELTA requires a delta path"),
            source_len,
            SEGMENT_SIZE,
            config.compress.then_some(config.level),
        )?)
    } else {
        None
    };

    let results: Vec<Result<WorkerStats, EngineError>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(partitions.len());
        let mut remaining_delta = delta_writer.as_mut();

        for (worker_id, range) in partitions.iter().enumerate() {
            let store_partition = store_partitions.remove(0);
            let store_base_segment = layout::segment_count(range.start);
            let windows = build_windows(range.start, range.end, changemap.as_ref());
            let is_last_worker = worker_id + 1 == partitions.len();
            let delta = remaining_delta.take();

            let source_path = config.source.as_path();
            let target_path = config.target.as_deref();
            let cache_bypass = config.cache_bypass;
            let throttle_mb_s = config.throttle_mb_s;
            let mode = config.mode;

            if worker_id > 0 {
                std::thread::sleep(THREAD_STAGGER);
            }

            handles.push(scope.spawn(move || -> Result<WorkerStats, EngineError> {
                let cache_mode = if cache_bypass { CacheMode::Bypass } else { CacheMode::Buffered };
                let source = device_io::open_read_only(source_path, cache_mode)?;
                let target = match (mode, target_path) {
                    (RunMode::SourceTarget, Some(path)) => Some(device_io::open_read_write(path)?),
                    _ => None,
                };

                run_worker(WorkerInput {
                    mode,
                    source,
                    source_path,
                    target,
                    target_path,
                    store: store_partition,
                    store_base_segment,
                    windows,
                    is_last_worker,
                    source_len,
                    delta,
                    throttle_mb_s,
                })
            }));
        }

        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(EngineError::WorkerPanicked)))
            .collect()
    });

    if let Some(writer) = delta_writer {
        writer.finish()?;
    }

    let mut totals = WorkerStats::default();
    for result in results {
        totals.merge(&result?);
    }

    if config.mode != RunMode::DdZone {
        store.close()?;
    }

    Ok(RunOutcome::Completed(RunStats {
        totals,
        elapsed: started.elapsed(),
    }))
}

/// Computes each worker's `[start, end)` byte range per the partitioning
/// rule: `buffers_per_worker = max(1, floor(source_bytes / 8MiB) / workers)`,
/// every worker owns that many buffers except the last, which extends to
/// the end of the source.
fn partition_ranges(source_len: u64, workers: usize) -> Vec<std::ops::Range<u64>> {
    let total_buffers = source_len / BUFFER_SIZE;
    let buffers_per_worker = (total_buffers / workers as u64).max(1);
    let stride = buffers_per_worker * BUFFER_SIZE;

    let mut ranges = Vec::with_capacity(workers);
    for w in 0..workers {
        let start = (w as u64 * stride).min(source_len);
        let end = if w + 1 == workers { source_len } else { (start + stride).min(source_len) };
        ranges.push(start..end);
    }
    ranges
}

fn build_windows(
    start: u64,
    end: u64,
    changemap: Option<&changemap::ChangeMap>,
) -> Vec<BufferWindow> {
    match changemap {
        None => crate::worker::tile_partition(start, end),
        Some(map) => {
            let seg_start = start / SEGMENT_SIZE;
            let seg_end = end / SEGMENT_SIZE;
            map.runs_in_range(BUFFER_SIZE, seg_start, seg_end)
                .into_iter()
                .map(|(offset, len)| BufferWindow { offset, len })
                .collect()
        }
    }
}

/// Opens (or creates) the target, refusing to shrink an existing regular
/// file smaller than the source requires.
fn prepare_target(target_path: &Path, source_len: u64) -> Result<(), EngineError> {
    let file = device_io::open_read_write(target_path)?;
    let is_regular_file = file.metadata().map(|m| m.is_file()).unwrap_or(false);
    let current_len = file.metadata().map(|m| m.len()).unwrap_or(source_len);

    if is_regular_file {
        if current_len > source_len {
            return Err(EngineError::SizeShrinkRefused {
                path: target_path.display().to_string(),
                current: current_len,
                requested: source_len,
            });
        }
        if current_len < source_len {
            device_io::set_len(&file, target_path, source_len)?;
        }
    }
    drop(file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_ranges_splits_evenly() {
        let ranges = partition_ranges(4 * BUFFER_SIZE, 2);
        assert_eq!(ranges[0], 0..2 * BUFFER_SIZE);
        assert_eq!(ranges[1], 2 * BUFFER_SIZE..4 * BUFFER_SIZE);
    }

    #[test]
    fn last_worker_extends_to_source_end() {
        let ranges = partition_ranges(4 * BUFFER_SIZE + 100, 2);
        assert_eq!(ranges[0], 0..2 * BUFFER_SIZE);
        assert_eq!(ranges[1], 2 * BUFFER_SIZE..4 * BUFFER_SIZE + 100);
    }

    #[test]
    fn single_worker_covers_whole_source() {
        let ranges = partition_ranges(12345, 1);
        assert_eq!(ranges, vec![0..12345]);
    }
}
