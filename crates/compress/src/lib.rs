#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! zlib compression helpers for the delta region payloads. A region's
//! compressed length becomes its stored `length` field in the delta file
//! (see the `delta` crate), so callers need the compressed byte count, not
//! just a success/failure result.
//!
//! # Examples
//!
//! ```
//! use compress::{CompressionLevel, compress_to_vec, decompress_to_vec};
//!
//! let level = CompressionLevel::new(6).unwrap();
//! let compressed = compress_to_vec(b"a segment of repeated bytes", level).unwrap();
//! let restored = decompress_to_vec(&compressed, 28).unwrap();
//! assert_eq!(restored, b"a segment of repeated bytes");
//! ```

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

/// Errors raised while compressing or decompressing a region payload.
#[derive(Debug, Error)]
pub enum CompressError {
    /// The requested compression level was outside `1..=9`.
    #[error("compression level {0} is outside the valid 1..=9 range")]
    InvalidLevel(u8),
    /// Deflating the payload failed.
    #[error("failed to compress region payload: {0}")]
    Compress(#[source] std::io::Error),
    /// Inflating the payload failed.
    #[error("failed to decompress region payload: {0}")]
    Decompress(#[source] std::io::Error),
}

/// A validated zlib compression level, 1 (fastest) through 9 (smallest).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// The engine's default level when `-z` is given without `-l`.
    pub const DEFAULT: Self = Self(6);

    /// Validates `level` is in `1..=9`.
    pub fn new(level: u8) -> Result<Self, CompressError> {
        if (1..=9).contains(&level) {
            Ok(Self(level))
        } else {
            Err(CompressError::InvalidLevel(level))
        }
    }

    fn as_flate2(self) -> Compression {
        Compression::new(u32::from(self.0))
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Compresses `data` at `level`, returning the compressed bytes.
pub fn compress_to_vec(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, CompressError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level.as_flate2());
    encoder.write_all(data).map_err(CompressError::Compress)?;
    encoder.finish().map_err(CompressError::Compress)
}

/// Decompresses `data`, which is expected to inflate to exactly
/// `expected_len` bytes (the region's recorded raw length).
pub fn decompress_to_vec(data: &[u8], expected_len: usize) -> Result<Vec<u8>, CompressError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut out)
        .map_err(CompressError::Decompress)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_compression() {
        let data = vec![7u8; 16384];
        let level = CompressionLevel::new(9).unwrap();
        let compressed = compress_to_vec(&data, level).unwrap();
        assert!(compressed.len() < data.len());
        let restored = decompress_to_vec(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn rejects_out_of_range_levels() {
        assert!(CompressionLevel::new(0).is_err());
        assert!(CompressionLevel::new(10).is_err());
    }

    #[test]
    fn default_level_is_six() {
        assert_eq!(CompressionLevel::default(), CompressionLevel::new(6).unwrap());
    }

    #[test]
    fn incompressible_random_like_data_still_round_trips() {
        let data: Vec<u8> = (0..16384u32)
            .map(|i| i.wrapping_mul(2654435761) as u8)
            .collect();
        let level = CompressionLevel::DEFAULT;
        let compressed = compress_to_vec(&data, level).unwrap();
        let restored = decompress_to_vec(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }
}
