//! Error taxonomy for the worker pipeline, matching the kinds the core
//! recognises: I/O failures at each call site, allocation/mapping failures,
//! delta framing mismatches, and the refuse-shrink invariant.

use thiserror::Error;

/// Errors the engine can surface from a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Opening a source, target, or store path failed.
    #[error("failed to open {path}: {source}")]
    IoOpen {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A seek failed.
    #[error("failed to seek {path}: {source}")]
    IoSeek {
        /// Path being seeked.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A read returned fewer bytes than required outside the one
    /// permissible case (the last worker's final buffer).
    #[error("short read from {path}: expected {expected} bytes, got {got}")]
    IoReadShort {
        /// Path being read.
        path: String,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually read.
        got: usize,
    },
    /// A read failed outright.
    #[error("failed to read {path}: {source}")]
    IoReadFail {
        /// Path being read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A write failed after the resume loop gave up (disk full, broken
    /// pipe, or similar).
    #[error("failed to write {path}: {source}")]
    IoWriteFail {
        /// Path being written.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A buffer allocation failed.
    #[error("allocation failed: {0}")]
    AllocFail(String),
    /// Memory-mapping the checksum store failed.
    #[error("checksum store error: {0}")]
    MapFail(#[from] store::StoreError),
    /// A delta operation failed: bad framing magic, a region I/O error, or
    /// a refused shrink surfaced through the delta crate.
    #[error("delta error: {0}")]
    Delta(#[from] delta::DeltaError),
    /// A regular-file target is larger than the source and would need to
    /// shrink; refused.
    #[error("refusing to shrink target {path} from {current} to {requested} bytes")]
    SizeShrinkRefused {
        /// Path of the target.
        path: String,
        /// Current on-disk length.
        current: u64,
        /// Length the run requires.
        requested: u64,
    },
    /// Compressing a region payload failed.
    #[error("compression failed: {0}")]
    CompressFail(#[from] compress::CompressError),
    /// The change-map file could not be parsed.
    #[error("change map error: {0}")]
    ChangeMap(#[from] changemap::ChangeMapError),
    /// A worker thread panicked instead of returning a completion code.
    #[error("worker thread panicked")]
    WorkerPanicked,
}

impl From<device_io::DeviceIoError> for EngineError {
    fn from(err: device_io::DeviceIoError) -> Self {
        match err {
            device_io::DeviceIoError::Open { path, source } => Self::IoOpen { path, source },
            device_io::DeviceIoError::Seek { path, source } => Self::IoSeek { path, source },
            device_io::DeviceIoError::SetLen { path, source } => Self::IoWriteFail { path, source },
            device_io::DeviceIoError::Write { path, source } => Self::IoWriteFail { path, source },
        }
    }
}
