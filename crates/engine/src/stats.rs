//! Per-worker counters and their aggregation into the run-level summary
//! appended to the stats sidecar.

use std::path::Path;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

const STATS_TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Counters owned by one worker thread; summed by the driver after join.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    /// Number of 8 MiB read buffers processed.
    pub buffers_read: u64,
    /// Number of segments classified dirty.
    pub changed_segments: u64,
    /// Number of segments scanned (dirty or clean).
    pub total_segments: u64,
    /// Bytes written to the target, or emitted to a delta file.
    pub bytes_written: u64,
}

impl WorkerStats {
    /// Folds another worker's counters into this one.
    pub fn merge(&mut self, other: &Self) {
        self.buffers_read += other.buffers_read;
        self.changed_segments += other.changed_segments;
        self.total_segments += other.total_segments;
        self.bytes_written += other.bytes_written;
    }
}

/// The aggregated result of one run, ready to append to the stats
/// sidecar or print as a human-readable summary.
#[derive(Clone, Copy, Debug)]
pub struct RunStats {
    /// Sum of every worker's [`WorkerStats`].
    pub totals: WorkerStats,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunStats {
    /// Fraction of scanned segments classified dirty, `0.0` if nothing was
    /// scanned.
    #[must_use]
    pub fn segment_change_ratio(&self) -> f64 {
        if self.totals.total_segments == 0 {
            0.0
        } else {
            self.totals.changed_segments as f64 / self.totals.total_segments as f64
        }
    }

    /// Throughput in MB/s (10^6 bytes per second), `0.0` if elapsed time
    /// rounds to zero.
    #[must_use]
    pub fn megabytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            (self.totals.bytes_written as f64 / 1_000_000.0) / secs
        }
    }

    /// Formats the one-line stats sidecar record:
    /// `YYYY-MM-DD HH:MM:SS <ratio> segment_change_ratio <written> bytes_written <secs> seconds <MB/s> MB/s`.
    #[must_use]
    pub fn sidecar_line(&self, at: OffsetDateTime) -> String {
        let timestamp = at
            .format(STATS_TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| "0000-00-00 00:00:00".to_string());
        format!(
            "{timestamp} {:.6} segment_change_ratio {} bytes_written {:.3} seconds {:.3} MB/s",
            self.segment_change_ratio(),
            self.totals.bytes_written,
            self.elapsed.as_secs_f64(),
            self.megabytes_per_second()
        )
    }
}

/// Appends `line` to `<checksum_path>.stats`, creating the sidecar file
/// if it does not yet exist.
pub fn append_sidecar(checksum_path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut sidecar_path = checksum_path.as_os_str().to_owned();
    sidecar_path.push(".stats");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(sidecar_path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn merge_sums_every_counter() {
        let mut total = WorkerStats::default();
        total.merge(&WorkerStats {
            buffers_read: 2,
            changed_segments: 5,
            total_segments: 10,
            bytes_written: 1000,
        });
        total.merge(&WorkerStats {
            buffers_read: 3,
            changed_segments: 1,
            total_segments: 10,
            bytes_written: 500,
        });
        assert_eq!(total.buffers_read, 5);
        assert_eq!(total.changed_segments, 6);
        assert_eq!(total.total_segments, 20);
        assert_eq!(total.bytes_written, 1500);
    }

    #[test]
    fn segment_change_ratio_handles_empty_run() {
        let stats = RunStats {
            totals: WorkerStats::default(),
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(stats.segment_change_ratio(), 0.0);
    }

    #[test]
    fn sidecar_line_matches_expected_shape() {
        let stats = RunStats {
            totals: WorkerStats {
                buffers_read: 1,
                changed_segments: 1,
                total_segments: 2,
                bytes_written: 2_000_000,
            },
            elapsed: Duration::from_secs(2),
        };
        let line = stats.sidecar_line(datetime!(2026-07-31 12:00:00 UTC));
        assert_eq!(
            line,
            "2026-07-31 12:00:00 0.500000 segment_change_ratio 2000000 bytes_written 2.000 seconds 1.000 MB/s"
        );
    }

    #[test]
    fn append_sidecar_writes_to_suffixed_path() {
        let dir = tempfile::tempdir().unwrap();
        let checksum_path = dir.path().join("store.idx");
        append_sidecar(&checksum_path, "line one").unwrap();
        append_sidecar(&checksum_path, "line two").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("store.idx.stats")).unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }
}
