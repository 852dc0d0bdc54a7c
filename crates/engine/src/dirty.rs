//! The per-buffer dirty-segment run accumulator: a 513-entry array (512
//! segments plus a trailing sentinel) that coalesces adjacent dirty
//! segments into the maximal contiguous runs workers write or emit as a
//! single I/O.

use layout::{SEGMENT_SIZE, SEGMENTS_PER_BUFFER};

/// One maximal contiguous run of dirty segments within a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirtyRun {
    /// Index of the run's first segment within the buffer.
    pub start_segment: usize,
    /// Byte offset of the run's start, relative to the buffer origin.
    pub byte_offset: u64,
    /// Total length of the run in bytes.
    pub length: u64,
}

/// Transient state of the dirty-run accumulator while scanning one
/// buffer's entries.
enum RunState {
    /// No run open; accumulated run length is zero.
    Idle,
    /// A run is open, started at `start_segment`/`byte_offset`.
    InRun {
        start_segment: usize,
        byte_offset: u64,
        length: u64,
    },
}

/// The 513-entry dirty map for one read buffer: entry `i` is `0` if
/// segment `i` is clean, or its byte count if dirty. The trailing
/// sentinel at `SEGMENTS_PER_BUFFER` is always zero and closes any run
/// still open at the end of a buffer.
pub struct DirtyMap {
    entries: [u64; SEGMENTS_PER_BUFFER + 1],
}

impl DirtyMap {
    /// Builds a freshly cleared map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: [0; SEGMENTS_PER_BUFFER + 1],
        }
    }

    /// Clears every entry, ready for the next buffer.
    pub fn clear(&mut self) {
        self.entries = [0; SEGMENTS_PER_BUFFER + 1];
    }

    /// Marks segment `index` dirty with `seg_bytes` bytes.
    pub fn mark(&mut self, index: usize, seg_bytes: u64) {
        self.entries[index] = seg_bytes;
    }

    /// Coalesces the first `n_segments` entries, plus the trailing
    /// sentinel, into maximal contiguous dirty runs.
    #[must_use]
    pub fn runs(&self, n_segments: usize) -> Vec<DirtyRun> {
        let mut runs = Vec::new();
        let mut state = RunState::Idle;

        for segment in 0..=n_segments {
            let entry = self.entries[segment];
            match &mut state {
                RunState::Idle if entry != 0 => {
                    state = RunState::InRun {
                        start_segment: segment,
                        byte_offset: segment as u64 * SEGMENT_SIZE,
                        length: entry,
                    };
                }
                RunState::Idle => {}
                RunState::InRun { length, .. } if entry != 0 => {
                    *length += entry;
                }
                RunState::InRun { .. } => {
                    if let RunState::InRun {
                        start_segment,
                        byte_offset,
                        length,
                    } = std::mem::replace(&mut state, RunState::Idle)
                    {
                        runs.push(DirtyRun {
                            start_segment,
                            byte_offset,
                            length,
                        });
                    }
                }
            }
        }
        runs
    }
}

impl Default for DirtyMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_buffer_has_no_runs() {
        let map = DirtyMap::new();
        assert!(map.runs(512).is_empty());
    }

    #[test]
    fn single_dirty_segment_is_one_run() {
        let mut map = DirtyMap::new();
        map.mark(3, SEGMENT_SIZE);
        let runs = map.runs(512);
        assert_eq!(
            runs,
            vec![DirtyRun {
                start_segment: 3,
                byte_offset: 3 * SEGMENT_SIZE,
                length: SEGMENT_SIZE,
            }]
        );
    }

    #[test]
    fn adjacent_dirty_segments_coalesce() {
        let mut map = DirtyMap::new();
        map.mark(0, SEGMENT_SIZE);
        map.mark(1, SEGMENT_SIZE);
        map.mark(4, 100);
        let runs = map.runs(5);
        assert_eq!(
            runs,
            vec![
                DirtyRun {
                    start_segment: 0,
                    byte_offset: 0,
                    length: 2 * SEGMENT_SIZE,
                },
                DirtyRun {
                    start_segment: 4,
                    byte_offset: 4 * SEGMENT_SIZE,
                    length: 100,
                },
            ]
        );
    }

    #[test]
    fn trailing_sentinel_closes_run_open_at_buffer_end() {
        let mut map = DirtyMap::new();
        map.mark(511, SEGMENT_SIZE);
        let runs = map.runs(512);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_segment, 511);
    }

    #[test]
    fn clear_resets_all_entries() {
        let mut map = DirtyMap::new();
        map.mark(0, SEGMENT_SIZE);
        map.clear();
        assert!(map.runs(512).is_empty());
    }
}
