//! Compaction: dead space reclamation for the log
//!
//! Overwritten and deleted keys leave dead records behind. Compaction writes
//! the live index into a fresh log file that opens with a checkpoint record,
//! then drops every older file.
//!
//! Crash safety comes from the atomic rename pattern:
//! 1. Write the checkpoint file as `log-{seq}.stow.compact`
//! 2. `durable_sync` it
//! 3. Rename it to `log-{seq}.stow` (atomic on POSIX)
//! 4. Sync the directory
//! 5. Remove the superseded files
//!
//! A crash before step 3 leaves an orphan `.compact` file, removed on the next
//! open. A crash after it replays the old files and then the checkpoint, which
//! resets the index, so the result is the same either way.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::config::DiskConfig;
use crate::error::{DiskError, DiskResult};
use crate::format::{encode_record, Op};
use crate::log::{log_file_name, log_files};
use crate::platform_durability::{durable_sync, sync_directory};

const COMPACT_SUFFIX: &str = ".compact";

/// Below this many records a log is never worth compacting.
pub const MIN_COMPACTION_RECORDS: u64 = 16;

/// Result of a compaction.
#[derive(Debug)]
pub struct CompactionResult {
    /// The checkpoint file now holding every live record
    pub file_path: PathBuf,
    pub sequence: u64,
    /// Records in the log before compaction
    pub original_records: u64,
    /// Live records written to the checkpoint file
    pub live_records: u64,
    pub original_bytes: u64,
    pub compacted_bytes: u64,
}

impl CompactionResult {
    pub fn removed_records(&self) -> u64 {
        self.original_records.saturating_sub(self.live_records)
    }

    /// Ratio of dead records before compaction (0.0 = no waste, 1.0 = all waste).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_records == 0 {
            return 0.0;
        }
        self.removed_records() as f64 / self.original_records as f64
    }

    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// True when the dead-record ratio has reached `threshold`.
pub fn needs_compaction(total_records: u64, live_records: u64, threshold: f64) -> bool {
    if total_records < MIN_COMPACTION_RECORDS {
        return false;
    }
    let dead_ratio = 1.0 - (live_records as f64 / total_records as f64);
    dead_ratio >= threshold
}

/// Write `live` as checkpoint log `sequence` in `dir`.
///
/// Returns the path and size of the new file. Older files are left in place;
/// see [`remove_superseded`].
pub fn write_checkpoint(
    dir: &Path,
    sequence: u64,
    live: &HashMap<String, Vec<u8>>,
    config: &DiskConfig,
) -> DiskResult<(PathBuf, u64)> {
    let final_path = dir.join(log_file_name(sequence));
    let compact_path = dir.join(format!("{}{}", log_file_name(sequence), COMPACT_SUFFIX));

    let mut bytes = encode_record(Op::Checkpoint, b"", b"", config)?;
    for (key, value) in live {
        bytes.extend(encode_record(Op::Put, key.as_bytes(), value, config)?);
    }

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&compact_path)
            .map_err(|e| DiskError::io(&compact_path, e, "Failed to create compact file"))?;
        file.write_all(&bytes)
            .map_err(|e| DiskError::io(&compact_path, e, "Failed to write compacted records"))?;
        durable_sync(&file)
            .map_err(|e| DiskError::io(&compact_path, e, "Failed to sync compacted file"))?;
    }

    fs::rename(&compact_path, &final_path)
        .map_err(|e| DiskError::io(&final_path, e, "Failed to rename compacted file"))?;
    sync_directory(dir)
        .map_err(|e| DiskError::io(dir, e, "Failed to sync directory after compaction"))?;

    Ok((final_path, bytes.len() as u64))
}

/// Remove log files older than `sequence`; returns how many were removed.
pub fn remove_superseded(dir: &Path, sequence: u64) -> DiskResult<usize> {
    let mut removed = 0;
    for (old, path) in log_files(dir)? {
        if old >= sequence {
            continue;
        }
        // Still correct if this fails: the checkpoint masks the old records
        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to remove superseded log {}: {}", path.display(), e);
            continue;
        }
        removed += 1;
    }
    if removed > 0 {
        sync_directory(dir)
            .map_err(|e| DiskError::io(dir, e, "Failed to sync directory after cleanup"))?;
    }
    Ok(removed)
}

/// Remove `.compact` files left by an interrupted compaction.
pub fn remove_orphans(dir: &Path) -> DiskResult<usize> {
    let entries =
        fs::read_dir(dir).map_err(|e| DiskError::io(dir, e, "Failed to read log directory"))?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let is_orphan =
            entry.file_name().to_str().is_some_and(|name| name.ends_with(COMPACT_SUFFIX));
        if is_orphan {
            let path = entry.path();
            debug!("Removing interrupted compaction output {}", path.display());
            fs::remove_file(&path)
                .map_err(|e| DiskError::io(&path, e, "Failed to remove orphaned compact file"))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogReader;
    use tempfile::TempDir;

    fn live(entries: &[(&str, &str)]) -> HashMap<String, Vec<u8>> {
        entries.iter().map(|(key, value)| (key.to_string(), value.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_checkpoint_replays_as_reset() {
        let tmp = TempDir::new().unwrap();
        let config = DiskConfig::default();
        let stale = encode_record(Op::Put, b"stale", b"1", &config).unwrap();
        fs::write(tmp.path().join(log_file_name(0)), stale).unwrap();

        let (path, size) =
            write_checkpoint(tmp.path(), 1, &live(&[("keep", "2")]), &config).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), size);

        let records = LogReader::new(tmp.path()).recover().unwrap().records;
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].op, Op::Checkpoint);
        assert_eq!(records[2].key, b"keep");
    }

    #[test]
    fn test_remove_superseded() {
        let tmp = TempDir::new().unwrap();
        let config = DiskConfig::default();
        for sequence in 0..3 {
            fs::write(tmp.path().join(log_file_name(sequence)), b"").unwrap();
        }
        write_checkpoint(tmp.path(), 3, &live(&[]), &config).unwrap();

        assert_eq!(remove_superseded(tmp.path(), 3).unwrap(), 3);
        let remaining: Vec<u64> =
            log_files(tmp.path()).unwrap().into_iter().map(|(sequence, _)| sequence).collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn test_remove_orphans() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(log_file_name(0)), b"").unwrap();
        let orphan = format!("{}{}", log_file_name(1), COMPACT_SUFFIX);
        fs::write(tmp.path().join(orphan), b"partial").unwrap();

        assert_eq!(remove_orphans(tmp.path()).unwrap(), 1);
        assert_eq!(log_files(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_needs_compaction_threshold() {
        // 20 records, 12 live = 40% dead
        assert!(needs_compaction(20, 12, 0.3));
        assert!(!needs_compaction(20, 12, 0.5));
        // Too small to bother
        assert!(!needs_compaction(4, 0, 0.3));
    }

    #[test]
    fn test_dead_space_ratio() {
        let result = CompactionResult {
            file_path: PathBuf::from("/tmp/test"),
            sequence: 1,
            original_records: 100,
            live_records: 60,
            original_bytes: 10000,
            compacted_bytes: 6000,
        };

        assert_eq!(result.removed_records(), 40);
        assert!((result.dead_space_ratio() - 0.4).abs() < f64::EPSILON);
        assert_eq!(result.bytes_saved(), 4000);
    }
}
