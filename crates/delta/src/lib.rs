#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `delta` implements the self-describing delta artifact: a 40-byte header,
//! a sequence of region records written in source-offset order, and a
//! 32-byte footer. [`DeltaWriter`] produces one during a `SOURCE_DELTA` run;
//! [`DeltaReader`]/[`apply_to_target`] consume one for `SHOW_DELTA` and
//! `APPLY_DELTA`.
//!
//! # Format
//!
//! ```text
//! header (40 bytes):
//!   8  magic start   b"beefcake"
//!   8  magic version ASCII, e.g. b"   v2.01"
//!   8  source_size        u64
//!   8  check_seg_size     u64
//!   8  conf_opts          u64  (bit0 registered, bit1 compressed, bit2 encrypted)
//! region record (repeated):
//!   8  source_offset  u64
//!   8  stored_length  u64
//!   stored_length bytes of payload (compressed iff conf_opts bit1 is set)
//! footer (32 bytes):
//!   8  region_count          u64
//!   8  total_raw_bytes       u64
//!   8  total_compressed_bytes u64
//!   8  magic end     b"tailcafe"
//! ```
//!
//! All multi-byte integers are written native-endian; this workspace always
//! targets little-endian hosts.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use compress::CompressionLevel;
use store::{ChecksumStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

const MAGIC_START: &[u8; 8] = b"beefcake";
const MAGIC_END: &[u8; 8] = b"tailcafe";
const MAGIC_VERSION: &[u8; 8] = b"   v1.00";
const HEADER_LEN: u64 = 40;
const FOOTER_LEN: u64 = 32;

/// `conf_opts` bit 0: the delta was produced against a registered source
/// (round-tripped, never interpreted by this engine).
pub const CONF_REGISTERED: u64 = 1 << 0;
/// `conf_opts` bit 1: region payloads are zlib-compressed.
pub const CONF_COMPRESSED: u64 = 1 << 1;
/// `conf_opts` bit 2: reserved for encryption; defined but never honoured.
pub const CONF_ENCRYPTED: u64 = 1 << 2;

/// Errors raised by the delta writer, reader, or applier.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// Opening the delta or target failed.
    #[error("failed to open {path}: {source}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Start or end magic did not match the expected constant.
    #[error("delta file {path} has an invalid {which} magic")]
    MagicMismatch {
        /// Path of the delta file.
        path: String,
        /// Which magic failed: "start" or "end".
        which: &'static str,
    },
    /// A record's payload failed to (de)compress.
    #[error("delta region payload error: {0}")]
    Compress(#[from] compress::CompressError),
    /// The checksum store could not be opened while applying.
    #[error("checksum store error: {0}")]
    Store(#[from] StoreError),
    /// The target is a regular file smaller than the source it must grow
    /// to, but is currently larger and would need to shrink.
    #[error("refusing to shrink target {path} from {current} to {requested} bytes")]
    ShrinkRefused {
        /// Path of the target.
        path: String,
        /// Current on-disk length.
        current: u64,
        /// Length the apply step requires.
        requested: u64,
    },
    /// Apply was requested without a target path.
    #[error("applying a delta requires a target path")]
    MissingTarget,
}

/// Decoded delta header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeltaHeader {
    /// Total byte length of the source the delta was captured from.
    pub source_size: u64,
    /// Segment size used while capturing the delta (normally
    /// [`layout::SEGMENT_SIZE`]).
    pub check_seg_size: u64,
    /// Bitmask: bit0 registered, bit1 compressed, bit2 encrypted.
    pub conf_opts: u64,
}

impl DeltaHeader {
    /// `true` if region payloads are zlib-compressed.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.conf_opts & CONF_COMPRESSED != 0
    }
}

/// Decoded delta footer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeltaFooter {
    /// Number of region records between header and footer.
    pub region_count: u64,
    /// Sum of each region's uncompressed byte length.
    pub total_raw_bytes: u64,
    /// Sum of each region's stored (possibly compressed) byte length.
    pub total_compressed_bytes: u64,
}

/// Writes a delta file one region at a time.
///
/// `SOURCE_DELTA` forces a single worker, so a `DeltaWriter` is never shared
/// across threads; region records are appended in the order the caller
/// hands them over, which for one worker is strictly increasing source
/// offset.
pub struct DeltaWriter {
    file: File,
    compression: Option<CompressionLevel>,
    region_count: u64,
    total_raw_bytes: u64,
    total_compressed_bytes: u64,
}

impl DeltaWriter {
    /// Creates `path` and writes the header. `compression` being `Some`
    /// sets `conf_opts` bit 1 and compresses every appended region.
    pub fn create(
        path: &Path,
        source_size: u64,
        check_seg_size: u64,
        compression: Option<CompressionLevel>,
    ) -> Result<Self, DeltaError> {
        let mut file = File::create(path).map_err(|source| DeltaError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut conf_opts = 0u64;
        if compression.is_some() {
            conf_opts |= CONF_COMPRESSED;
        }

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC_START);
        header.extend_from_slice(MAGIC_VERSION);
        header.extend_from_slice(&source_size.to_ne_bytes());
        header.extend_from_slice(&check_seg_size.to_ne_bytes());
        header.extend_from_slice(&conf_opts.to_ne_bytes());
        file.write_all(&header).map_err(|source| DeltaError::Io {
            path: path.display().to_string(),
            source,
        })?;

        info!(path = %path.display(), compressed = compression.is_some(), "opened delta for writing");

        Ok(Self {
            file,
            compression,
            region_count: 0,
            total_raw_bytes: 0,
            total_compressed_bytes: 0,
        })
    }

    /// Appends one changed region. `payload` is the raw (uncompressed)
    /// bytes; compression, if configured, is applied here.
    pub fn append_region(&mut self, source_offset: u64, payload: &[u8]) -> Result<(), DeltaError> {
        let stored = match self.compression {
            Some(level) => compress::compress_to_vec(payload, level)?,
            None => payload.to_vec(),
        };

        self.file
            .write_all(&source_offset.to_ne_bytes())
            .and_then(|()| self.file.write_all(&(stored.len() as u64).to_ne_bytes()))
            .and_then(|()| self.file.write_all(&stored))
            .map_err(|source| DeltaError::Io {
                path: "<delta>".to_string(),
                source,
            })?;

        self.region_count += 1;
        self.total_raw_bytes += payload.len() as u64;
        self.total_compressed_bytes += stored.len() as u64;
        Ok(())
    }

    /// Writes the footer and flushes. Returns the final region count, for
    /// stats reporting.
    pub fn finish(mut self) -> Result<u64, DeltaError> {
        let mut footer = Vec::with_capacity(FOOTER_LEN as usize);
        footer.extend_from_slice(&self.region_count.to_ne_bytes());
        footer.extend_from_slice(&self.total_raw_bytes.to_ne_bytes());
        footer.extend_from_slice(&self.total_compressed_bytes.to_ne_bytes());
        footer.extend_from_slice(MAGIC_END);
        self.file
            .write_all(&footer)
            .map_err(|source| DeltaError::Io {
                path: "<delta>".to_string(),
                source,
            })?;
        info!(regions = self.region_count, "closed delta file");
        Ok(self.region_count)
    }
}

/// An open delta file ready for `SHOW_DELTA` inspection or `APPLY_DELTA`.
pub struct DeltaReader {
    file: File,
    path: String,
    /// Decoded header.
    pub header: DeltaHeader,
    /// Decoded footer.
    pub footer: DeltaFooter,
}

impl DeltaReader {
    /// Opens `path`, validates both magics, and decodes the header and
    /// footer.
    pub fn open(path: &Path) -> Result<Self, DeltaError> {
        let display_path = path.display().to_string();
        let mut file = File::open(path).map_err(|source| DeltaError::Io {
            path: display_path.clone(),
            source,
        })?;

        let mut header_bytes = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header_bytes)
            .map_err(|source| DeltaError::Io {
                path: display_path.clone(),
                source,
            })?;
        if &header_bytes[0..8] != MAGIC_START {
            warn!(path = %display_path, "delta header magic mismatch");
            return Err(DeltaError::MagicMismatch {
                path: display_path,
                which: "start",
            });
        }
        let source_size = u64::from_ne_bytes(header_bytes[16..24].try_into().unwrap());
        let check_seg_size = u64::from_ne_bytes(header_bytes[24..32].try_into().unwrap());
        let conf_opts = u64::from_ne_bytes(header_bytes[32..40].try_into().unwrap());

        let file_len = file
            .seek(SeekFrom::End(0))
            .map_err(|source| DeltaError::Io {
                path: display_path.clone(),
                source,
            })?;
        let mut footer_bytes = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::Start(file_len - FOOTER_LEN))
            .and_then(|_| file.read_exact(&mut footer_bytes))
            .map_err(|source| DeltaError::Io {
                path: display_path.clone(),
                source,
            })?;
        if &footer_bytes[24..32] != MAGIC_END {
            warn!(path = %display_path, "delta footer magic mismatch");
            return Err(DeltaError::MagicMismatch {
                path: display_path,
                which: "end",
            });
        }
        let region_count = u64::from_ne_bytes(footer_bytes[0..8].try_into().unwrap());
        let total_raw_bytes = u64::from_ne_bytes(footer_bytes[8..16].try_into().unwrap());
        let total_compressed_bytes = u64::from_ne_bytes(footer_bytes[16..24].try_into().unwrap());

        file.seek(SeekFrom::Start(HEADER_LEN))
            .map_err(|source| DeltaError::Io {
                path: display_path.clone(),
                source,
            })?;

        Ok(Self {
            file,
            path: display_path,
            header: DeltaHeader {
                source_size,
                check_seg_size,
                conf_opts,
            },
            footer: DeltaFooter {
                region_count,
                total_raw_bytes,
                total_compressed_bytes,
            },
        })
    }

    /// Iterates the region records in file order, decompressing each
    /// payload if the header's compressed bit is set.
    pub fn regions(&mut self) -> RegionIter<'_> {
        RegionIter {
            reader: self,
            remaining: 0,
            seen: 0,
        }
    }
}

/// One decoded region record.
pub struct Region {
    /// Byte offset in the source/target this region covers.
    pub source_offset: u64,
    /// Decompressed payload bytes.
    pub payload: Vec<u8>,
}

/// Iterator over a delta file's region records.
pub struct RegionIter<'a> {
    reader: &'a mut DeltaReader,
    remaining: u64,
    seen: u64,
}

impl Iterator for RegionIter<'_> {
    type Item = Result<Region, DeltaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.remaining = self.reader.footer.region_count;
        }
        if self.seen >= self.remaining {
            return None;
        }
        self.seen += 1;

        let mut fields = [0u8; 16];
        if let Err(source) = self.reader.file.read_exact(&mut fields) {
            return Some(Err(DeltaError::Io {
                path: self.reader.path.clone(),
                source,
            }));
        }
        let source_offset = u64::from_ne_bytes(fields[0..8].try_into().unwrap());
        let stored_len = u64::from_ne_bytes(fields[8..16].try_into().unwrap());

        let mut stored = vec![0u8; stored_len as usize];
        if let Err(source) = self.reader.file.read_exact(&mut stored) {
            return Some(Err(DeltaError::Io {
                path: self.reader.path.clone(),
                source,
            }));
        }

        let payload = if self.reader.header.is_compressed() {
            match compress::decompress_to_vec(&stored, self.reader.header.check_seg_size as usize * 512) {
                Ok(p) => p,
                Err(e) => return Some(Err(DeltaError::Compress(e))),
            }
        } else {
            stored
        };

        Some(Ok(Region {
            source_offset,
            payload,
        }))
    }
}

/// Applies every region of an already-opened delta to `target_path`,
/// optionally maintaining `checksum_path` with freshly computed
/// fingerprints for each covered segment.
pub fn apply_to_target(
    reader: &mut DeltaReader,
    target_path: &Path,
    checksum_path: Option<&Path>,
) -> Result<u64, DeltaError> {
    let source_size = reader.header.source_size;
    let seg_size = reader.header.check_seg_size;

    let target_exists = target_path.exists();
    let current_len = if target_exists {
        std::fs::metadata(target_path)
            .map_err(|source| DeltaError::Io {
                path: target_path.display().to_string(),
                source,
            })?
            .len()
    } else {
        0
    };
    if target_exists
        && target_path.metadata().map(|m| m.is_file()).unwrap_or(false)
        && current_len > source_size
    {
        return Err(DeltaError::ShrinkRefused {
            path: target_path.display().to_string(),
            current: current_len,
            requested: source_size,
        });
    }

    let mut target = device_io::open_read_write(target_path).map_err(|e| DeltaError::Io {
        path: target_path.display().to_string(),
        source: std::io::Error::other(e),
    })?;
    device_io::set_len(&target, target_path, source_size.max(current_len)).map_err(|e| {
        DeltaError::Io {
            path: target_path.display().to_string(),
            source: std::io::Error::other(e),
        }
    })?;

    let mut store = match checksum_path {
        Some(path) => Some(ChecksumStore::open_or_create(path, source_size)?),
        None => None,
    };

    let mut applied = 0u64;
    for region in reader.regions() {
        let region = region?;
        device_io::write_all_resuming(&mut target, region.source_offset, &region.payload)
            .map_err(|e| DeltaError::Io {
                path: target_path.display().to_string(),
                source: std::io::Error::other(e),
            })?;

        if let Some(store) = store.as_mut() {
            let entry_counts = vec![layout::expected_store_len(source_size) / 8];
            let mut parts = store.partition_mut(&entry_counts);
            let partition = &mut parts[0];
            let base_segment = region.source_offset / seg_size;
            for (i, chunk) in region.payload.chunks(seg_size as usize).enumerate() {
                let fp = hashing::fingerprint(chunk);
                partition.set(base_segment + i as u64, fp.into());
            }
        }
        applied += 1;
    }

    if let Some(store) = store {
        store.close()?;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layout::SEGMENT_SIZE;

    #[test]
    fn round_trips_header_and_footer_without_compression() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.delta");
        let mut writer = DeltaWriter::create(&path, 3 * SEGMENT_SIZE, SEGMENT_SIZE, None).unwrap();
        writer.append_region(0, &vec![1u8; 16384]).unwrap();
        writer.append_region(SEGMENT_SIZE, &vec![2u8; 16384]).unwrap();
        writer.finish().unwrap();

        let reader = DeltaReader::open(&path).unwrap();
        assert_eq!(reader.header.source_size, 3 * SEGMENT_SIZE);
        assert_eq!(reader.footer.region_count, 2);
        assert_eq!(reader.footer.total_raw_bytes, 32768);
        assert_eq!(reader.footer.total_compressed_bytes, 32768);
    }

    #[test]
    fn magic_bytes_are_at_expected_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.delta");
        let mut writer = DeltaWriter::create(&path, SEGMENT_SIZE, SEGMENT_SIZE, None).unwrap();
        writer.append_region(0, &vec![9u8; 16384]).unwrap();
        writer.finish().unwrap();

        let mut raw = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut raw).unwrap();
        assert_eq!(&raw[0..8], MAGIC_START);
        assert_eq!(&raw[raw.len() - 8..], MAGIC_END);
    }

    #[test]
    fn compressed_round_trip_via_region_iterator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.delta");
        let level = CompressionLevel::new(6).unwrap();
        let payload = vec![5u8; 16384];
        let mut writer = DeltaWriter::create(&path, SEGMENT_SIZE, SEGMENT_SIZE, Some(level)).unwrap();
        writer.append_region(0, &payload).unwrap();
        writer.finish().unwrap();

        let mut reader = DeltaReader::open(&path).unwrap();
        assert!(reader.header.is_compressed());
        let regions: Vec<_> = reader.regions().collect::<Result<_, _>>().unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].payload, payload);
    }

    #[test]
    fn rejects_bad_start_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.delta");
        std::fs::write(&path, vec![0u8; 72]).unwrap();
        assert!(matches!(
            DeltaReader::open(&path),
            Err(DeltaError::MagicMismatch { which: "start", .. })
        ));
    }

    #[test]
    fn apply_writes_regions_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let delta_path = dir.path().join("d.delta");
        let target_path = dir.path().join("target.bin");

        let mut writer =
            DeltaWriter::create(&delta_path, 2 * SEGMENT_SIZE, SEGMENT_SIZE, None).unwrap();
        writer.append_region(0, &vec![0xAAu8; 16384]).unwrap();
        writer.finish().unwrap();

        let mut reader = DeltaReader::open(&delta_path).unwrap();
        let applied = apply_to_target(&mut reader, &target_path, None).unwrap();
        assert_eq!(applied, 1);

        let mut out = Vec::new();
        File::open(&target_path)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(&out[0..16384], &vec![0xAAu8; 16384][..]);
    }
}
