//! Disk backend for Stowage
//!
//! Implements the store's [`stowage_core::StorageProvider`] contract over a
//! RAM index and a crash-safe, checksummed append-only log.
//!
//! # Architecture
//!
//! - Values are stored as JSON bytes, one record per write
//! - Every record carries a CRC32C checksum; damaged records are skipped on
//!   recovery and a torn tail is truncated
//! - Log files rotate by size; compaction rewrites the live set behind a
//!   checkpoint record and drops older files
//! - Capacity limits surface as quota errors, which the store answers by
//!   evicting least recently used keys

pub mod compaction;
pub mod config;
pub mod error;
pub mod format;
pub mod log;
pub mod platform_durability;
pub mod provider;

pub use compaction::CompactionResult;
pub use config::DiskConfig;
pub use error::{DiskError, DiskResult};
pub use provider::{DiskProvider, DiskStats};
