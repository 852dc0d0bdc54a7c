#![deny(missing_docs)]

//! # Overview
//!
//! `store` implements the checksum store: a memory-mapped array of
//! [`FingerprintPair`] entries, one per source segment, that the worker
//! pipeline consults to decide whether a segment changed since the previous
//! run.
//!
//! # Design
//!
//! [`ChecksumStore::open_or_create`] distinguishes three cases: the sink path
//! `/dev/null` (no-store mode, every segment is treated as dirty and nothing
//! is persisted), an existing store of the expected length (opened and
//! mapped read-write), and anything else (a "new store": created or resized
//! to exactly the expected length and marked so every comparison is forced
//! dirty for this run, which resolves the zero-fingerprint ambiguity between
//! a fresh sparse entry and a segment whose true fingerprint happens to be
//! `(0, 0)`).
//!
//! Workers never share mutable access to the same entries: [`ChecksumStore::partition_mut`]
//! splits the backing byte slice into disjoint partitions up front using
//! safe `split_at_mut`, so no runtime locking is required once partitioning
//! is done.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use layout::{FINGERPRINT_PAIR_BYTES, FingerprintPair};
use memmap2::MmapMut;
use thiserror::Error;

/// Errors raised by checksum store lifecycle operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening or creating the backing file failed.
    #[error("failed to open checksum store {path}: {source}")]
    Open {
        /// Path of the store file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Resizing the backing file failed.
    #[error("failed to size checksum store {path} to {len} bytes: {source}")]
    Resize {
        /// Path of the store file.
        path: String,
        /// Target length in bytes.
        len: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Memory-mapping the backing file failed.
    #[error("failed to mmap checksum store {path}: {source}")]
    Map {
        /// Path of the store file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `load_existing` was asked to open a store that does not exist.
    #[error("checksum store {path} does not exist")]
    Missing {
        /// Path that was expected to exist.
        path: String,
    },
    /// Touching the file's mtime after unmapping failed.
    #[error("failed to update mtime of checksum store {path}: {source}")]
    Touch {
        /// Path of the store file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Path recognised as the "no store" sink: every segment is treated as
/// dirty and no checksum file is created or touched.
pub const NO_STORE_SINK: &str = "/dev/null";

enum Backing {
    NoStore,
    Mapped {
        file: File,
        path: PathBuf,
        mmap: MmapMut,
        is_new: bool,
    },
}

/// A checksum store, either memory-mapped or in no-store (`/dev/null`) mode.
pub struct ChecksumStore {
    backing: Backing,
}

impl ChecksumStore {
    /// Opens `path` for `expected_bytes` worth of source, creating or
    /// resizing the store if it is absent or the wrong length. See the
    /// module docs for the three cases this distinguishes.
    pub fn open_or_create(path: &Path, expected_bytes: u64) -> Result<Self, StoreError> {
        if path == Path::new(NO_STORE_SINK) {
            return Ok(Self {
                backing: Backing::NoStore,
            });
        }

        let expected_len = layout::expected_store_len(expected_bytes);
        let existing_len = std::fs::metadata(path).ok().map(|m| m.len());
        let is_new = existing_len != Some(expected_len);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| StoreError::Open {
                path: path.display().to_string(),
                source,
            })?;

        if is_new {
            file.set_len(expected_len)
                .map_err(|source| StoreError::Resize {
                    path: path.display().to_string(),
                    len: expected_len,
                    source,
                })?;
        }

        // SAFETY-free: memmap2 guards the unsafe mmap syscall internally;
        // this crate forbids unsafe code itself.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| StoreError::Map {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            backing: Backing::Mapped {
                file,
                path: path.to_path_buf(),
                mmap,
                is_new,
            },
        })
    }

    /// Opens an existing store for read-write mapping, failing if it is
    /// absent. Used by the delta applier, which never creates a store on
    /// its own initiative unless the caller names a checksum path.
    pub fn load_existing(path: &Path) -> Result<Self, StoreError> {
        if path == Path::new(NO_STORE_SINK) {
            return Ok(Self {
                backing: Backing::NoStore,
            });
        }
        if !path.exists() {
            return Err(StoreError::Missing {
                path: path.display().to_string(),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| StoreError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| StoreError::Map {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            backing: Backing::Mapped {
                file,
                path: path.to_path_buf(),
                mmap,
                is_new: false,
            },
        })
    }

    /// `true` when operating in no-store (`/dev/null`) mode.
    #[must_use]
    pub const fn is_no_store(&self) -> bool {
        matches!(self.backing, Backing::NoStore)
    }

    /// `true` when this store was just created or resized this run, forcing
    /// every comparison to classify as dirty.
    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self.backing, Backing::Mapped { is_new: true, .. })
    }

    /// Total number of fingerprint-pair entries in the store (0 in
    /// no-store mode).
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        match &self.backing {
            Backing::NoStore => 0,
            Backing::Mapped { mmap, .. } => mmap.len() as u64 / FINGERPRINT_PAIR_BYTES,
        }
    }

    /// Splits the store into disjoint partitions, one per entry in
    /// `entry_counts` (which must sum to `entry_count()`). Used by the
    /// driver before spawning workers so each worker owns an exclusive,
    /// lock-free byte range.
    pub fn partition_mut(&mut self, entry_counts: &[u64]) -> Vec<StorePartition<'_>> {
        match &mut self.backing {
            Backing::NoStore => entry_counts.iter().map(|_| StorePartition::NoStore).collect(),
            Backing::Mapped { mmap, is_new, .. } => {
                let mut rest: &mut [u8] = &mut mmap[..];
                let mut parts = Vec::with_capacity(entry_counts.len());
                for &count in entry_counts {
                    let split_at = (count * FINGERPRINT_PAIR_BYTES) as usize;
                    let (head, tail) = rest.split_at_mut(split_at);
                    rest = tail;
                    parts.push(StorePartition::Mapped {
                        bytes: head,
                        is_new: *is_new,
                    });
                }
                parts
            }
        }
    }

    /// Unmaps and closes the store, then touches its mtime: memory-mapped
    /// writes do not reliably bump a file's modification time, and
    /// downstream backup tooling depends on seeing it change.
    pub fn close(self) -> Result<(), StoreError> {
        match self.backing {
            Backing::NoStore => Ok(()),
            Backing::Mapped { file, path, mmap, .. } => {
                drop(mmap);
                drop(file);
                filetime::set_file_mtime(&path, filetime::FileTime::now()).map_err(|source| {
                    StoreError::Touch {
                        path: path.display().to_string(),
                        source,
                    }
                })
            }
        }
    }
}

/// A worker's exclusive slice of the checksum store.
pub enum StorePartition<'a> {
    /// No backing store; every segment is dirty.
    NoStore,
    /// A memory-mapped byte range owned exclusively by one worker.
    Mapped {
        /// Raw little-endian-encoded fingerprint pairs.
        bytes: &'a mut [u8],
        /// Whether the owning store was newly created/resized this run.
        is_new: bool,
    },
}

impl StorePartition<'_> {
    /// Number of entries in this partition.
    #[must_use]
    pub fn len_entries(&self) -> u64 {
        match self {
            Self::NoStore => 0,
            Self::Mapped { bytes, .. } => bytes.len() as u64 / FINGERPRINT_PAIR_BYTES,
        }
    }

    /// `true` if the owning store was newly created/resized this run.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Mapped { is_new: true, .. })
    }

    /// Reads the fingerprint pair at `local_index` within this partition.
    #[must_use]
    pub fn get(&self, local_index: u64) -> FingerprintPair {
        match self {
            Self::NoStore => FingerprintPair::default(),
            Self::Mapped { bytes, .. } => {
                let offset = (local_index * FINGERPRINT_PAIR_BYTES) as usize;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[offset..offset + 8]);
                FingerprintPair::from_le_bytes(raw)
            }
        }
    }

    /// Overwrites the fingerprint pair at `local_index` within this
    /// partition. A torn write under a crash is acceptable: the next run
    /// observes a mismatch and simply rewrites the segment.
    pub fn set(&mut self, local_index: u64, pair: FingerprintPair) {
        if let Self::Mapped { bytes, .. } = self {
            let offset = (local_index * FINGERPRINT_PAIR_BYTES) as usize;
            bytes[offset..offset + 8].copy_from_slice(&pair.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_created_at_expected_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.idx");
        let store = ChecksumStore::open_or_create(&path, 3 * layout::SEGMENT_SIZE).unwrap();
        assert!(store.is_new());
        assert_eq!(store.entry_count(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);
    }

    #[test]
    fn reopening_with_same_length_is_not_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.idx");
        ChecksumStore::open_or_create(&path, 2 * layout::SEGMENT_SIZE)
            .unwrap()
            .close()
            .unwrap();
        let store = ChecksumStore::open_or_create(&path, 2 * layout::SEGMENT_SIZE).unwrap();
        assert!(!store.is_new());
    }

    #[test]
    fn wrong_length_forces_new_store_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.idx");
        ChecksumStore::open_or_create(&path, 2 * layout::SEGMENT_SIZE)
            .unwrap()
            .close()
            .unwrap();
        let store = ChecksumStore::open_or_create(&path, 5 * layout::SEGMENT_SIZE).unwrap();
        assert!(store.is_new());
        assert_eq!(store.entry_count(), 5);
    }

    #[test]
    fn dev_null_is_no_store_mode() {
        let store = ChecksumStore::open_or_create(Path::new("/dev/null"), 4096).unwrap();
        assert!(store.is_no_store());
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn partitions_are_independently_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.idx");
        let mut store = ChecksumStore::open_or_create(&path, 4 * layout::SEGMENT_SIZE).unwrap();
        let mut parts = store.partition_mut(&[2, 2]);
        parts[0].set(0, FingerprintPair { murmur: 1, crc32: 2 });
        parts[1].set(1, FingerprintPair { murmur: 9, crc32: 9 });
        assert_eq!(parts[0].get(0), FingerprintPair { murmur: 1, crc32: 2 });
        assert_eq!(parts[1].get(0), FingerprintPair::default());
        assert_eq!(parts[1].get(1), FingerprintPair { murmur: 9, crc32: 9 });
    }

    #[test]
    fn load_existing_fails_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.idx");
        assert!(matches!(
            ChecksumStore::load_existing(&path),
            Err(StoreError::Missing { .. })
        ));
    }

    #[test]
    fn close_touches_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.idx");
        let store = ChecksumStore::open_or_create(&path, layout::SEGMENT_SIZE).unwrap();
        store.close().unwrap();
        assert!(std::fs::metadata(&path).unwrap().modified().is_ok());
    }
}
