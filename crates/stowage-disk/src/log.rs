//! Append-only record log
//!
//! The log is a directory of files named `log-{sequence:016x}.stow`, replayed
//! in sequence order on open. Write ordering for every append:
//! 1. Encode the record (checksum included)
//! 2. Append the bytes to the current file
//! 3. `durable_sync` when durable writes are enabled
//! 4. Return, after which the caller updates its in-memory index
//!
//! The index is only ever updated for records that reached the file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DiskError, DiskResult};
use crate::format::{decode_record, find_next_magic, LogRecord, HEADER_SIZE};
use crate::platform_durability::durable_sync;

const LOG_PREFIX: &str = "log-";
const LOG_SUFFIX: &str = ".stow";

/// File name for log `sequence`.
pub fn log_file_name(sequence: u64) -> String {
    format!("{}{:016x}{}", LOG_PREFIX, sequence, LOG_SUFFIX)
}

fn parse_sequence(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// Log files in `dir`, ordered by sequence.
pub fn log_files(dir: &Path) -> DiskResult<Vec<(u64, PathBuf)>> {
    let entries =
        fs::read_dir(dir).map_err(|e| DiskError::io(dir, e, "Failed to read log directory"))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DiskError::io(dir, e, "Failed to read directory entry"))?;
        if let Some(sequence) = entry.file_name().to_str().and_then(parse_sequence) {
            files.push((sequence, entry.path()));
        }
    }
    files.sort_by_key(|(sequence, _)| *sequence);
    Ok(files)
}

/// Appends encoded records to the newest log file, rotating by size.
pub struct LogWriter {
    file: File,
    /// Path of the current file, for error context
    path: PathBuf,
    /// Current file size, tracked to avoid stat calls
    size: u64,
    dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
    durable: bool,
}

impl LogWriter {
    /// Open (or create) log `sequence` in `dir` for appending.
    pub fn open(dir: &Path, sequence: u64, rotation_size: u64, durable: bool) -> DiskResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| DiskError::io(dir, e, "Failed to create log directory"))?;

        let path = dir.join(log_file_name(sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DiskError::io(&path, e, "Failed to open log file"))?;
        let size =
            file.metadata().map_err(|e| DiskError::io(&path, e, "Failed to stat log file"))?.len();

        Ok(Self { file, path, size, dir: dir.to_path_buf(), sequence, rotation_size, durable })
    }

    /// Append encoded records as one write.
    ///
    /// A batch is never split across files, so it may overshoot the rotation
    /// size; the next append then rotates.
    pub fn append(&mut self, bytes: &[u8]) -> DiskResult<()> {
        if self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file.write_all(bytes).map_err(|e| DiskError::io(&self.path, e, "Log write failed"))?;
        self.size += bytes.len() as u64;

        if self.durable {
            self.sync()?;
        }
        Ok(())
    }

    /// Sync the current file without writing anything.
    pub fn sync(&self) -> DiskResult<()> {
        durable_sync(&self.file)
            .map_err(|e| DiskError::io(&self.path, e, "Log durable_sync failed"))
    }

    /// Switch to a new file. The current one is synced first.
    fn rotate(&mut self) -> DiskResult<()> {
        self.sync()?;

        let next = Self::open(&self.dir, self.sequence + 1, self.rotation_size, self.durable)?;
        debug!("Rotated log {} -> {}", self.path.display(), next.path.display());
        *self = next;
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }
}

/// Everything replayed from a log directory.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Intact records in write order
    pub records: Vec<LogRecord>,
    /// Bytes of all log files after repair
    pub total_bytes: u64,
    /// Highest sequence found, 0 for an empty directory
    pub last_sequence: u64,
    /// Bytes skipped because they failed validation
    pub skipped_bytes: u64,
}

/// Replays log files in sequence order.
pub struct LogReader {
    dir: PathBuf,
}

impl LogReader {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    /// Recover every intact record.
    ///
    /// Per file: validate magic, length and checksum of each record. Damaged
    /// records are skipped by scanning to the next magic. A torn record at the
    /// end of the newest file is the crash point; it is truncated away so new
    /// appends start on a clean boundary.
    pub fn recover(&self) -> DiskResult<Recovered> {
        let mut recovered = Recovered::default();
        let files = log_files(&self.dir)?;
        let newest = files.last().map(|(sequence, _)| *sequence);

        for (sequence, path) in &files {
            let valid_len = self.recover_file(path, &mut recovered)?;
            let file_len = fs::metadata(path)
                .map_err(|e| DiskError::io(path, e, "Failed to stat log file"))?
                .len();

            let mut kept = file_len;
            if Some(*sequence) == newest && valid_len < file_len {
                warn!(
                    "Truncating torn tail of {} at offset {} ({} bytes)",
                    path.display(),
                    valid_len,
                    file_len - valid_len
                );
                truncate(path, valid_len)?;
                kept = valid_len;
            }
            recovered.total_bytes += kept;
            recovered.last_sequence = *sequence;
        }

        Ok(recovered)
    }

    /// Replay one file; returns the offset just past its last intact record.
    fn recover_file(&self, path: &Path, recovered: &mut Recovered) -> DiskResult<u64> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut buffer))
            .map_err(|e| DiskError::io(path, e, "Failed to read log file"))?;

        let mut offset = 0;
        let mut valid_len = 0;

        while offset < buffer.len() {
            match decode_record(&buffer[offset..], path, offset as u64) {
                Ok((record, used)) => {
                    recovered.records.push(record);
                    offset += used;
                    valid_len = offset;
                }
                Err(DiskError::TornWrite { .. })
                    if find_next_magic(&buffer, offset + HEADER_SIZE).is_none() =>
                {
                    warn!(
                        "Torn write in {} at offset {}: {} bytes incomplete",
                        path.display(),
                        offset,
                        buffer.len() - offset
                    );
                    break;
                }
                Err(err) => {
                    warn!("Skipping damaged log data: {}", err);
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => {
                            recovered.skipped_bytes += (next - offset) as u64;
                            offset = next;
                        }
                        None => {
                            recovered.skipped_bytes += (buffer.len() - offset) as u64;
                            break;
                        }
                    }
                }
            }
        }

        Ok(valid_len as u64)
    }
}

fn truncate(path: &Path, len: u64) -> DiskResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| DiskError::io(path, e, "Failed to open log file"))?;
    file.set_len(len).map_err(|e| DiskError::io(path, e, "Failed to truncate log file"))?;
    durable_sync(&file).map_err(|e| DiskError::io(path, e, "Failed to sync truncated log file"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::format::{encode_record, Op, MAGIC_ARRAY};
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> Vec<u8> {
        encode_record(Op::Put, key.as_bytes(), value.as_bytes(), &DiskConfig::default()).unwrap()
    }

    #[test]
    fn test_log_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();

        let mut writer = LogWriter::open(temp.path(), 0, 1024 * 1024, true).unwrap();
        writer.append(&put("key1", "1")).unwrap();
        writer.append(&put("key2", "2")).unwrap();
        let delete = encode_record(Op::Delete, b"key1", b"", &DiskConfig::default()).unwrap();
        writer.append(&delete).unwrap();
        let written = writer.current_size();
        drop(writer);

        let recovered = LogReader::new(temp.path()).recover().unwrap();
        assert_eq!(recovered.records.len(), 3);
        assert_eq!(recovered.records[0].key, b"key1");
        assert_eq!(recovered.records[1].value, b"2");
        assert_eq!(recovered.records[2].op, Op::Delete);
        assert_eq!(recovered.total_bytes, written);
        assert_eq!(recovered.skipped_bytes, 0);
    }

    #[test]
    fn test_rotation_creates_new_files() {
        let temp = TempDir::new().unwrap();
        let record = put("key", "value");

        let mut writer = LogWriter::open(temp.path(), 0, record.len() as u64 * 2, false).unwrap();
        for _ in 0..5 {
            writer.append(&record).unwrap();
        }
        assert_eq!(writer.sequence(), 2);
        drop(writer);

        let files = log_files(temp.path()).unwrap();
        assert_eq!(files.iter().map(|(sequence, _)| *sequence).collect::<Vec<_>>(), vec![0, 1, 2]);

        let recovered = LogReader::new(temp.path()).recover().unwrap();
        assert_eq!(recovered.records.len(), 5);
        assert_eq!(recovered.last_sequence, 2);
    }

    #[test]
    fn test_corruption_recovery_skips_bad_record() {
        let temp = TempDir::new().unwrap();
        let first = put("good1", "1");

        let mut writer = LogWriter::open(temp.path(), 0, 1024 * 1024, true).unwrap();
        writer.append(&first).unwrap();
        writer.append(&put("good2", "2")).unwrap();
        writer.append(&put("good3", "3")).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        // Flip a payload byte of the second record
        let mut data = fs::read(&path).unwrap();
        data[first.len() + HEADER_SIZE + 9] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let recovered = LogReader::new(temp.path()).recover().unwrap();
        let keys: Vec<&[u8]> =
            recovered.records.iter().map(|record| record.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"good1"[..], &b"good3"[..]]);
        assert!(recovered.skipped_bytes > 0);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let temp = TempDir::new().unwrap();

        let mut writer = LogWriter::open(temp.path(), 0, 1024 * 1024, true).unwrap();
        writer.append(&put("complete", "1")).unwrap();
        let path = writer.current_path().to_path_buf();
        let intact = writer.current_size();
        drop(writer);

        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&MAGIC_ARRAY);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        fs::write(&path, data).unwrap();

        let recovered = LogReader::new(temp.path()).recover().unwrap();
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.records[0].key, b"complete");
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        assert_eq!(recovered.total_bytes, intact);

        // Appends after repair replay cleanly
        let mut writer =
            LogWriter::open(temp.path(), recovered.last_sequence, 1024 * 1024, true).unwrap();
        writer.append(&put("after", "2")).unwrap();
        drop(writer);
        assert_eq!(LogReader::new(temp.path()).recover().unwrap().records.len(), 2);
    }

    #[test]
    fn test_empty_directory() {
        let temp = TempDir::new().unwrap();
        let recovered = LogReader::new(temp.path()).recover().unwrap();
        assert!(recovered.records.is_empty());
        assert_eq!(recovered.total_bytes, 0);
    }

    #[test]
    fn test_file_naming() {
        assert_eq!(log_file_name(26), "log-000000000000001a.stow");
        assert_eq!(parse_sequence("log-000000000000001a.stow"), Some(26));
        assert_eq!(parse_sequence("log-000000000000001a.stow.compact"), None);
        assert_eq!(parse_sequence("other.txt"), None);
    }
}
