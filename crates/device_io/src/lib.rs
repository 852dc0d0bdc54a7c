#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `device_io` opens block devices or regular files for the replication
//! engine. It exposes the small surface the engine needs: open for
//! read/read-write, query the byte length, and truncate-to-length, each with
//! an explicit error type rather than a bare `io::Error` so callers can map
//! failures onto the engine's error taxonomy.
//!
//! Cache-bypass (`O_DIRECT` on Linux) is opt-in and only meaningful on the
//! source read path; on platforms or filesystems that reject it, the flag is
//! silently dropped and a normal buffered open is used instead.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

/// Errors raised while opening or sizing a device/file.
#[derive(Debug, Error)]
pub enum DeviceIoError {
    /// Opening the path failed.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Path that could not be opened.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Seeking within the file failed.
    #[error("failed to seek {path}: {source}")]
    Seek {
        /// Path being seeked.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Truncating/extending the file failed.
    #[error("failed to set length of {path}: {source}")]
    SetLen {
        /// Path whose length could not be set.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Writing to the file failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Path being written.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Whether cache-bypass I/O was requested for an open.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum CacheMode {
    /// Use the platform's normal page cache.
    #[default]
    Buffered,
    /// Request the platform bypass the page cache where supported
    /// (`O_DIRECT` on Linux). Silently falls back to buffered I/O where
    /// unsupported.
    Bypass,
}

/// Opens `path` read-only, honouring `cache` where the platform supports it.
pub fn open_read_only(path: &Path, cache: CacheMode) -> Result<File, DeviceIoError> {
    let mut options = OpenOptions::new();
    options.read(true);
    apply_cache_mode(&mut options, cache);
    open(path, &options)
}

/// Opens `path` read-write, creating it if absent. Writes never use
/// cache-bypass, per the engine's write-path contract.
pub fn open_read_write(path: &Path) -> Result<File, DeviceIoError> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    open(path, &options)
}

#[cfg(all(unix, target_os = "linux"))]
fn apply_cache_mode(options: &mut OpenOptions, cache: CacheMode) {
    use std::os::unix::fs::OpenOptionsExt;
    if cache == CacheMode::Bypass {
        options.custom_flags(libc::O_DIRECT);
    }
}

#[cfg(not(all(unix, target_os = "linux")))]
fn apply_cache_mode(_options: &mut OpenOptions, _cache: CacheMode) {
    // O_DIRECT has no portable equivalent here; the flag is silently ignored.
}

fn open(path: &Path, options: &OpenOptions) -> Result<File, DeviceIoError> {
    match options.open(path) {
        Ok(file) => Ok(file),
        Err(source) if cache_bypass_rejected(&source) => {
            // Retry once without O_DIRECT: some filesystems (tmpfs, overlayfs)
            // reject it outright.
            let mut fallback = OpenOptions::new();
            fallback.read(true);
            fallback.open(path).map_err(|source| DeviceIoError::Open {
                path: path.display().to_string(),
                source,
            })
        }
        Err(source) => Err(DeviceIoError::Open {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn cache_bypass_rejected(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc_einval()
    )
}

#[cfg(unix)]
fn libc_einval() -> i32 {
    libc::EINVAL
}

#[cfg(not(unix))]
fn libc_einval() -> i32 {
    -1
}

/// Reports whether `path` currently exists.
#[must_use]
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Determines the byte length of an open file or block device via
/// seek-to-end / seek-to-start, since block devices do not always report a
/// useful `metadata().len()`.
pub fn size_in_bytes(file: &mut File) -> Result<u64, DeviceIoError> {
    let len = file
        .seek(SeekFrom::End(0))
        .map_err(|source| DeviceIoError::Seek {
            path: "<fd>".to_string(),
            source,
        })?;
    file.seek(SeekFrom::Start(0))
        .map_err(|source| DeviceIoError::Seek {
            path: "<fd>".to_string(),
            source,
        })?;
    Ok(len)
}

/// Sets a regular file's length to exactly `len` bytes (sparse extension is
/// allowed). Block devices are not resizable and must already be sized
/// `len`; callers are expected to check `size_in_bytes` first.
pub fn set_len(file: &File, path: &Path, len: u64) -> Result<(), DeviceIoError> {
    file.set_len(len).map_err(|source| DeviceIoError::SetLen {
        path: path.display().to_string(),
        source,
    })
}

/// Writes `data` at `offset`, looping on short writes until the full
/// payload lands or a hard error occurs. A short write is expected and
/// recoverable; a zero-byte write means the device can make no further
/// progress and is treated as a hard error.
pub fn write_all_resuming(file: &mut File, offset: u64, data: &[u8]) -> Result<(), DeviceIoError> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|source| DeviceIoError::Seek {
            path: "<fd>".to_string(),
            source,
        })?;
    let mut written = 0usize;
    while written < data.len() {
        let n = file
            .write(&data[written..])
            .map_err(|source| DeviceIoError::Write {
                path: "<fd>".to_string(),
                source,
            })?;
        if n == 0 {
            return Err(DeviceIoError::Write {
                path: "<fd>".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::WriteZero),
            });
        }
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn open_read_write_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new-file");
        let file = open_read_write(&path).unwrap();
        drop(file);
        assert!(path.exists());
    }

    #[test]
    fn size_in_bytes_reports_written_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sized");
        let mut file = open_read_write(&path).unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        assert_eq!(size_in_bytes(&mut file).unwrap(), 100);
    }

    #[test]
    fn set_len_extends_sparsely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse");
        let file = open_read_write(&path).unwrap();
        set_len(&file, &path, 1 << 20).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1 << 20);
    }

    #[test]
    fn open_read_only_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(open_read_only(&path, CacheMode::Buffered).is_err());
    }

    #[test]
    fn write_all_resuming_writes_full_payload_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");
        let mut file = open_read_write(&path).unwrap();
        set_len(&file, &path, 100).unwrap();
        write_all_resuming(&mut file, 50, &[7u8; 10]).unwrap();
        let mut out = vec![0u8; 100];
        use std::io::Read;
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut out).unwrap();
        assert_eq!(&out[50..60], &[7u8; 10][..]);
    }
}
