#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `changemap` parses an external bitmap file describing which segments of a
//! device changed since some prior external event, and turns set bits into
//! the contiguous read runs the worker pipeline consumes in "ddmap" mode.
//!
//! # Layout
//!
//! A 20-byte header (8-byte ASCII info tag, version, suspended flag, two
//! unused bytes, a name checksum, and a word count) is followed by
//! `map_size` 32-bit words of bitmap. Bit `b` (LSB = 0) of word `w`
//! corresponds to the segment at offset `(w * 32 + b) * SEGMENT_SIZE`, so one
//! word covers 512 KiB of source.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use layout::SEGMENT_SIZE;
use thiserror::Error;

const HEADER_LEN: usize = 20;
const INFO_LEN: usize = 8;

/// Errors raised while reading a change-map file.
#[derive(Debug, Error)]
pub enum ChangeMapError {
    /// Opening the map file failed.
    #[error("failed to open change map {path}: {source}")]
    Open {
        /// Path of the map file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The header was shorter than 20 bytes.
    #[error("change map {path} header is truncated")]
    ShortHeader {
        /// Path of the map file.
        path: String,
    },
    /// The bitmap body was shorter than `map_size * 4` bytes.
    #[error("change map {path} bitmap body is truncated: expected {expected} bytes, got {got}")]
    ShortBody {
        /// Path of the map file.
        path: String,
        /// Bytes required by the header's `map_size`.
        expected: usize,
        /// Bytes actually read.
        got: usize,
    },
}

/// Decoded change-map header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeMapHeader {
    /// Raw 8-byte ASCII info tag (informative only).
    pub info: [u8; INFO_LEN],
    /// Format version (accepted without validation; informative only).
    pub version: u8,
    /// Whether the map was in a suspended state while being produced.
    pub suspended: bool,
    /// Checksum over the target device's name (informative only).
    pub name_checksum: u32,
    /// Bitmap length in 32-bit words.
    pub map_size: u32,
}

/// A fully parsed change map: header plus the raw bitmap words.
#[derive(Clone, Debug)]
pub struct ChangeMap {
    /// Parsed header fields.
    pub header: ChangeMapHeader,
    words: Vec<u32>,
}

impl ChangeMap {
    /// Opens and parses a change-map file from `path`.
    pub fn open(path: &Path) -> Result<Self, ChangeMapError> {
        let mut file = File::open(path).map_err(|source| ChangeMapError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let mut header_bytes = [0u8; HEADER_LEN];
        read_exact_or(
            &mut file,
            &mut header_bytes,
            ChangeMapError::ShortHeader {
                path: path.display().to_string(),
            },
        )?;

        let mut info = [0u8; INFO_LEN];
        info.copy_from_slice(&header_bytes[0..8]);
        let version = header_bytes[8];
        let suspended = header_bytes[9] != 0;
        let name_checksum = u32::from_le_bytes(header_bytes[12..16].try_into().unwrap());
        let map_size = u32::from_le_bytes(header_bytes[16..20].try_into().unwrap());

        let body_len = map_size as usize * 4;
        let mut body = vec![0u8; body_len];
        let got = read_best_effort(&mut file, &mut body);
        if got != body_len {
            return Err(ChangeMapError::ShortBody {
                path: path.display().to_string(),
                expected: body_len,
                got,
            });
        }

        let words = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            header: ChangeMapHeader {
                info,
                version,
                suspended,
                name_checksum,
                map_size,
            },
            words,
        })
    }

    /// Number of segment bits represented by this map.
    #[must_use]
    pub fn segment_count(&self) -> u64 {
        self.words.len() as u64 * 32
    }

    /// Reports whether the bit for `segment_index` is set.
    #[must_use]
    pub fn is_set(&self, segment_index: u64) -> bool {
        let word_index = (segment_index / 32) as usize;
        let bit = (segment_index % 32) as u32;
        self.words
            .get(word_index)
            .is_some_and(|w| (w >> bit) & 1 == 1)
    }

    /// Coalesces set bits into maximal contiguous runs `(start_offset,
    /// length_bytes)`, capping any individual run at `cap_bytes` (the
    /// worker's read-buffer size) so no run requires more than one buffer's
    /// worth of I/O. A trailing run still open at end-of-map is flushed.
    #[must_use]
    pub fn runs(&self, cap_bytes: u64) -> Vec<(u64, u64)> {
        self.runs_in_range(cap_bytes, 0, self.segment_count())
    }

    /// Same coalescing rule as [`Self::runs`], restricted to the segment
    /// index range `[start_segment, end_segment)`. Used to drive one
    /// worker's share of the map so its partition of the bitmap mirrors
    /// the device partitioning exactly.
    #[must_use]
    pub fn runs_in_range(
        &self,
        cap_bytes: u64,
        start_segment: u64,
        end_segment: u64,
    ) -> Vec<(u64, u64)> {
        let cap_segments = cap_bytes / SEGMENT_SIZE;
        let end_segment = end_segment.min(self.segment_count());
        let mut runs = Vec::new();
        let mut run_start: Option<u64> = None;
        let mut run_len: u64 = 0;

        for segment in start_segment..end_segment {
            if self.is_set(segment) {
                if run_start.is_none() {
                    run_start = Some(segment);
                    run_len = 0;
                }
                run_len += 1;
                if run_len == cap_segments {
                    runs.push((run_start.unwrap() * SEGMENT_SIZE, run_len * SEGMENT_SIZE));
                    run_start = None;
                    run_len = 0;
                }
            } else if let Some(start) = run_start.take() {
                runs.push((start * SEGMENT_SIZE, run_len * SEGMENT_SIZE));
                run_len = 0;
            }
        }
        if let Some(start) = run_start {
            runs.push((start * SEGMENT_SIZE, run_len * SEGMENT_SIZE));
        }
        runs
    }
}

fn read_exact_or(
    file: &mut File,
    buf: &mut [u8],
    err: ChangeMapError,
) -> Result<(), ChangeMapError> {
    file.read_exact(buf).map_err(|_| err)
}

fn read_best_effort(file: &mut File, buf: &mut [u8]) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => break,
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_map(dir: &Path, words: &[u32]) -> std::path::PathBuf {
        let path = dir.join("change.map");
        let mut file = File::create(&path).unwrap();
        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(b"ddmap\0\0\0");
        header[8] = 1; // version
        header[9] = 0; // suspended
        header[12..16].copy_from_slice(&0xAABB_CCDDu32.to_le_bytes());
        header[16..20].copy_from_slice(&(words.len() as u32).to_le_bytes());
        file.write_all(&header).unwrap();
        for w in words {
            file.write_all(&w.to_le_bytes()).unwrap();
        }
        path
    }

    #[test]
    fn parses_header_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_map(dir.path(), &[0b1011]);
        let map = ChangeMap::open(&path).unwrap();
        assert_eq!(&map.header.info, b"ddmap\0\0\0");
        assert_eq!(map.header.version, 1);
        assert!(!map.header.suspended);
        assert_eq!(map.header.name_checksum, 0xAABB_CCDD);
        assert_eq!(map.header.map_size, 1);
    }

    #[test]
    fn bit_order_matches_lsb_zero_layout() {
        let dir = tempfile::tempdir().unwrap();
        // bits 0, 1, 4 set => segments 0, 1, 4.
        let path = write_map(dir.path(), &[0b1_0011]);
        let map = ChangeMap::open(&path).unwrap();
        assert!(map.is_set(0));
        assert!(map.is_set(1));
        assert!(!map.is_set(2));
        assert!(!map.is_set(3));
        assert!(map.is_set(4));
    }

    #[test]
    fn runs_coalesce_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_map(dir.path(), &[0b1_0011]);
        let map = ChangeMap::open(&path).unwrap();
        let runs = map.runs(8 * 1024 * 1024);
        assert_eq!(
            runs,
            vec![(0, 2 * SEGMENT_SIZE), (4 * SEGMENT_SIZE, SEGMENT_SIZE)]
        );
    }

    #[test]
    fn runs_flush_at_cap_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // All 32 bits set in one word => one run of 32 segments.
        let path = write_map(dir.path(), &[u32::MAX]);
        let map = ChangeMap::open(&path).unwrap();
        let cap = 10 * SEGMENT_SIZE;
        let runs = map.runs(cap);
        assert_eq!(runs.len(), 4); // 10 + 10 + 10 + 2
        assert_eq!(runs[0], (0, 10 * SEGMENT_SIZE));
        assert_eq!(runs[3], (30 * SEGMENT_SIZE, 2 * SEGMENT_SIZE));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.map");
        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(b"ddmap\0\0\0");
        header[16..20].copy_from_slice(&4u32.to_le_bytes());
        let mut file = File::create(&path).unwrap();
        file.write_all(&header).unwrap();
        file.write_all(&[0u8; 4]).unwrap(); // only 1 word, claims 4
        assert!(matches!(
            ChangeMap::open(&path),
            Err(ChangeMapError::ShortBody { .. })
        ));
    }
}
