//! The per-buffer hot loop: read, scan, compare, write/emit. One call to
//! [`run_worker`] executes a single worker's share of one run; the driver
//! spawns one of these per partition.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

use layout::SEGMENT_SIZE;
use store::StorePartition;

use crate::config::RunMode;
use crate::dirty::DirtyMap;
use crate::error::EngineError;
use crate::stats::WorkerStats;
use crate::throttle::Throttle;

/// One window of source bytes a worker reads in a single I/O: either a
/// fixed 8 MiB tile of a partition, or one change-map run (already capped
/// at 8 MiB by [`changemap::ChangeMap::runs`]).
#[derive(Clone, Copy, Debug)]
pub struct BufferWindow {
    /// Byte offset from the start of the source.
    pub offset: u64,
    /// Length of this window in bytes.
    pub len: u64,
}

/// Tiles `[start, end)` into sequential 8 MiB windows, the last of which
/// may be short.
#[must_use]
pub fn tile_partition(start: u64, end: u64) -> Vec<BufferWindow> {
    let mut windows = Vec::new();
    let mut offset = start;
    while offset < end {
        let len = layout::BUFFER_SIZE.min(end - offset);
        windows.push(BufferWindow { offset, len });
        offset += len;
    }
    windows
}

/// Everything one worker needs to process its share of a run.
pub struct WorkerInput<'a> {
    /// Which algorithm this worker runs.
    pub mode: RunMode,
    /// This worker's own open handle on the source.
    pub source: File,
    /// Path of the source, for error messages.
    pub source_path: &'a Path,
    /// This worker's own open handle on the target (`SOURCE_TARGET` only).
    pub target: Option<File>,
    /// Path of the target, for error messages.
    pub target_path: Option<&'a Path>,
    /// This worker's exclusive slice of the checksum store.
    pub store: StorePartition<'a>,
    /// Global segment index of this partition's first segment, for
    /// addressing into `store`.
    pub store_base_segment: u64,
    /// The windows this worker reads, in order: either a tiling of its
    /// partition, or the change-map runs falling inside it.
    pub windows: Vec<BufferWindow>,
    /// Whether this is the last worker (whose final window may be short).
    pub is_last_worker: bool,
    /// Total source length, to recognise a legitimately short final read.
    pub source_len: u64,
    /// Delta writer, present only for the single `SOURCE_DELTA` worker.
    pub delta: Option<&'a mut delta::DeltaWriter>,
    /// DDZONE per-worker throughput cap, if throttling is enabled.
    pub throttle_mb_s: Option<u64>,
}

/// Runs one worker's windows to completion, returning its counters.
pub fn run_worker(input: WorkerInput<'_>) -> Result<WorkerStats, EngineError> {
    let WorkerInput {
        mode,
        mut source,
        source_path,
        mut target,
        target_path,
        mut store,
        store_base_segment,
        windows,
        is_last_worker,
        source_len,
        mut delta,
        throttle_mb_s,
    } = input;

    let mut stats = WorkerStats::default();
    let mut dirty_map = DirtyMap::new();
    let mut throttle = throttle_mb_s.map(Throttle::new);
    let mut buffer = vec![0u8; layout::BUFFER_SIZE as usize];

    for (window_index, window) in windows.iter().enumerate() {
        let is_final_window = is_last_worker && window_index == windows.len() - 1;
        let started = Instant::now();

        source
            .seek(SeekFrom::Start(window.offset))
            .map_err(|source_err| EngineError::IoSeek {
                path: source_path.display().to_string(),
                source: source_err,
            })?;

        let read_buf = &mut buffer[..window.len as usize];
        let got = read_best_effort(&mut source, read_buf).map_err(|source_err| {
            EngineError::IoReadFail {
                path: source_path.display().to_string(),
                source: source_err,
            }
        })?;

        let short_read_is_legal = is_final_window && window.offset + got as u64 == source_len;
        if got < read_buf.len() && !short_read_is_legal {
            return Err(EngineError::IoReadShort {
                path: source_path.display().to_string(),
                expected: read_buf.len(),
                got,
            });
        }
        let read_buf = &read_buf[..got];

        stats.buffers_read += 1;

        if mode == RunMode::DdZone {
            if let Some(throttle) = throttle.as_mut() {
                let sleep = throttle.observe(got as u64, started.elapsed());
                println!(
                    "{}\t{}\t{:.6}",
                    window.offset,
                    got,
                    started.elapsed().as_secs_f64()
                );
                if sleep > Duration::ZERO {
                    std::thread::sleep(sleep);
                }
            } else {
                println!(
                    "{}\t{}\t{:.6}",
                    window.offset,
                    got,
                    started.elapsed().as_secs_f64()
                );
            }
            continue;
        }

        dirty_map.clear();
        let n_segments = read_buf.len().div_ceil(SEGMENT_SIZE as usize);
        let window_base_segment = window.offset / SEGMENT_SIZE;
        let local_base_segment = window_base_segment - store_base_segment;

        for s in 0..n_segments {
            let seg_start = s * SEGMENT_SIZE as usize;
            let seg_end = (seg_start + SEGMENT_SIZE as usize).min(read_buf.len());
            let seg_bytes = &read_buf[seg_start..seg_end];
            stats.total_segments += 1;

            if matches!(store, StorePartition::NoStore) {
                dirty_map.mark(s, seg_bytes.len() as u64);
                stats.changed_segments += 1;
                continue;
            }

            let fp = hashing::fingerprint(seg_bytes);
            let local_index = local_base_segment + s as u64;
            let stored = store.get(local_index);
            let changed = store.is_new() || fp != (stored.murmur, stored.crc32);

            if changed {
                if matches!(mode, RunMode::SourceTarget | RunMode::SourceDelta) {
                    dirty_map.mark(s, seg_bytes.len() as u64);
                    stats.changed_segments += 1;
                }
                store.set(local_index, fp.into());
            }
        }

        let runs = dirty_map.runs(n_segments);

        for run in &runs {
            let run_bytes = &read_buf[run.byte_offset as usize..(run.byte_offset + run.length) as usize];
            let absolute_offset = window.offset + run.byte_offset;

            match mode {
                RunMode::SourceTarget => {
                    let target = target.as_mut().ok_or_else(|| EngineError::IoWriteFail {
                        path: target_path.map(|p| p.display().to_string()).unwrap_or_default(),
                        source: std::io::Error::other("target required for SOURCE_TARGET"),
                    })?;
                    device_io::write_all_resuming(target, absolute_offset, run_bytes).map_err(
                        |e| EngineError::IoWriteFail {
                            path: target_path.map(|p| p.display().to_string()).unwrap_or_default(),
                            source: std::io::Error::other(e),
                        },
                    )?;
                    stats.bytes_written += run_bytes.len() as u64;
                }
                RunMode::SourceDelta => {
                    let writer = delta.as_deref_mut().expect("SOURCE_DELTA worker has a delta writer");
                    writer.append_region(absolute_offset, run_bytes)?;
                    stats.bytes_written += run_bytes.len() as u64;
                }
                RunMode::ChecksumOnly | RunMode::DdZone | RunMode::NewChecksum => {}
            }
        }
    }

    Ok(stats)
}

fn read_best_effort(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_partition_splits_into_full_buffers_plus_remainder() {
        let windows = tile_partition(0, layout::BUFFER_SIZE * 2 + 100);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].len, layout::BUFFER_SIZE);
        assert_eq!(windows[1].len, layout::BUFFER_SIZE);
        assert_eq!(windows[2].len, 100);
    }

    #[test]
    fn tile_partition_handles_exact_multiple() {
        let windows = tile_partition(0, layout::BUFFER_SIZE);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].len, layout::BUFFER_SIZE);
    }
}
