//! Error types for the disk backend
//!
//! `DiskError` carries the file and offset context needed to debug a damaged
//! log. At the backend boundary it is folded into the store's
//! [`StorageError`] classes, which decide how a failed write is retried.

use std::path::{Path, PathBuf};

use stowage_core::StorageError;
use thiserror::Error;

use crate::platform_durability::is_out_of_space;

/// Disk backend error types with detailed context
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiskError {
    /// I/O operation failed
    #[error("I/O error in {}: {message} ({kind})", display_path(.path))]
    Io {
        path: Option<PathBuf>,
        kind: std::io::ErrorKind,
        message: String,
    },

    /// The device ran out of space
    #[error("Out of disk space writing {}: {message}", show(.path))]
    OutOfSpace { path: PathBuf, message: String },

    /// Appending would grow the log past its configured capacity
    #[error("Log capacity exceeded: {requested_bytes} bytes requested, {remaining_bytes} remaining")]
    CapacityExceeded { requested_bytes: u64, remaining_bytes: u64 },

    /// Log file damaged beyond the record framing
    #[error("Log corrupted in {} at offset {offset}: {reason}", show(.path))]
    LogCorrupted { path: PathBuf, offset: u64, reason: String },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", show(.path))]
    ChecksumMismatch { path: PathBuf, expected: u32, actual: u32, offset: u64 },

    /// Partial record at the end of a log file
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", show(.path))]
    TornWrite { path: PathBuf, expected_size: u32, available_bytes: u64, offset: u64 },

    /// Magic bytes not found at expected location
    #[error(
        "Magic bytes not found in {} at offset {offset}: found {}",
        show(.path), hex(.found_bytes)
    )]
    NoMagicFound { path: PathBuf, offset: u64, found_bytes: [u8; 4] },

    /// Key or value larger than a record can hold
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry { entry_size: u64, max_size: u64, component: String },

    /// A stored value could not be encoded or decoded as JSON
    #[error("Invalid value for key '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Operation issued before the backend was opened
    #[error("Disk storage at {} is not open", show(.path))]
    NotOpen { path: PathBuf },

    #[error("Invalid disk configuration: {0}")]
    Config(String),
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref().map_or_else(|| "<unknown>".to_string(), |path| path.display().to_string())
}

fn show(path: &Path) -> std::path::Display<'_> {
    path.display()
}

fn hex(bytes: &[u8; 4]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

impl DiskError {
    /// Wrap an I/O error on `path`, recognizing a full device.
    pub fn io(path: &Path, err: std::io::Error, context: &str) -> Self {
        let message = format!("{}: {}", context, err);
        if is_out_of_space(&err) {
            return DiskError::OutOfSpace { path: path.to_path_buf(), message };
        }
        DiskError::Io { path: Some(path.to_path_buf()), kind: err.kind(), message }
    }
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io { path: None, kind: err.kind(), message: err.to_string() }
    }
}

/// Classify for the store's retry policy.
impl From<DiskError> for StorageError {
    fn from(err: DiskError) -> Self {
        match &err {
            DiskError::OutOfSpace { .. } | DiskError::CapacityExceeded { .. } => {
                StorageError::quota(err.to_string())
            }
            DiskError::InvalidValue { key, .. } => {
                StorageError::corrupt(Some(key), err.to_string())
            }
            DiskError::OversizedEntry { .. }
            | DiskError::LogCorrupted { .. }
            | DiskError::ChecksumMismatch { .. }
            | DiskError::TornWrite { .. }
            | DiskError::NoMagicFound { .. } => StorageError::corrupt(None, err.to_string()),
            DiskError::Io { .. } | DiskError::NotOpen { .. } | DiskError::Config(_) => {
                StorageError::transient(err.to_string())
            }
        }
    }
}

/// Result type alias for disk backend operations
pub type DiskResult<T> = Result<T, DiskError>;
