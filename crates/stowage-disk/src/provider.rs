//! Disk storage provider
//!
//! `DiskProvider` combines a RAM index with the checksummed append-only log.
//!
//! **Read path**: RAM index only (concurrent via RwLock)
//! **Write path**: log first, then the index. A write the log rejected never
//! reaches the index.
//! **Space**: capacity is measured in log bytes. Compaction runs when dead
//! records pile up, and once more before a write is refused for capacity.
//!
//! Opening is deferred to [`StorageProvider::init`], so a directory that cannot
//! be recovered surfaces as an init failure and the store falls back to memory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use stowage_core::storage::validate_payload;
use stowage_core::{
    apply_patch, DatabaseSize, MergePair, ReplaceNullPatch, StorageProvider, StorageResult,
};
use tracing::{debug, info, warn};

use crate::compaction::{
    needs_compaction, remove_orphans, remove_superseded, write_checkpoint, CompactionResult,
};
use crate::config::DiskConfig;
use crate::error::{DiskError, DiskResult};
use crate::format::{encode_record, Op};
use crate::log::{LogReader, LogWriter};

/// Writer-side state, present once the log is open.
struct LogState {
    writer: LogWriter,
    /// Bytes across all log files
    disk_bytes: u64,
    /// Records across all log files, dead ones included
    record_count: u64,
}

/// Point-in-time counters for an open provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStats {
    pub keys: usize,
    pub records: u64,
    pub disk_bytes: u64,
    pub sequence: u64,
}

/// A pending index change, applied once its record is in the log.
enum IndexChange {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Storage provider persisting JSON values to a log directory.
///
/// All methods take `&self`. Readers share the index lock; writers serialize
/// through the log mutex, then briefly hold the index write lock.
pub struct DiskProvider {
    dir: PathBuf,
    config: DiskConfig,
    /// `None` until the log has been recovered
    index: RwLock<Option<HashMap<String, Vec<u8>>>>,
    log: Mutex<Option<LogState>>,
}

fn encode_value(key: &str, value: &Value) -> DiskResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| DiskError::InvalidValue { key: key.to_owned(), message: e.to_string() })
}

fn decode_value(key: &str, bytes: &[u8]) -> DiskResult<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| DiskError::InvalidValue { key: key.to_owned(), message: e.to_string() })
}

impl DiskProvider {
    /// Create a provider for `dir`. Nothing is read until [`StorageProvider::init`].
    pub fn new<P: AsRef<Path>>(dir: P, config: DiskConfig) -> DiskResult<Self> {
        config.validate().map_err(DiskError::Config)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            config,
            index: RwLock::new(None),
            log: Mutex::new(None),
        })
    }

    /// Create and open in one step.
    pub fn open<P: AsRef<Path>>(dir: P, config: DiskConfig) -> DiskResult<Self> {
        let provider = Self::new(dir, config)?;
        provider.open_log()?;
        Ok(provider)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Counters, or `None` before the log is open.
    pub fn stats(&self) -> Option<DiskStats> {
        let log = self.log.lock();
        let state = log.as_ref()?;
        let keys = self.index.read().as_ref().map_or(0, |index| index.len());
        Some(DiskStats {
            keys,
            records: state.record_count,
            disk_bytes: state.disk_bytes,
            sequence: state.writer.sequence(),
        })
    }

    /// Recover the log into the index. Opening twice is a no-op.
    fn open_log(&self) -> DiskResult<()> {
        let mut log = self.log.lock();
        if log.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DiskError::io(&self.dir, e, "Failed to create storage directory"))?;
        let orphans = remove_orphans(&self.dir)?;
        if orphans > 0 {
            warn!(
                "Removed {} files left by an interrupted compaction in {}",
                orphans,
                self.dir.display()
            );
        }

        let recovered = LogReader::new(&self.dir).recover()?;
        let mut index = HashMap::new();
        for record in &recovered.records {
            match record.op {
                Op::Checkpoint => index.clear(),
                Op::Delete | Op::Put => {
                    let Ok(key) = std::str::from_utf8(&record.key) else {
                        warn!("Skipping log record with a non UTF-8 key");
                        continue;
                    };
                    if record.op == Op::Put {
                        index.insert(key.to_owned(), record.value.clone());
                    } else {
                        index.remove(key);
                    }
                }
            }
        }

        if !recovered.records.is_empty() {
            info!(
                "Recovered {} keys from {} log records at {}",
                index.len(),
                recovered.records.len(),
                self.dir.display()
            );
        }

        let writer =
            LogWriter::open(
                &self.dir,
                recovered.last_sequence,
                self.config.rotation_size_bytes,
                self.config.durable_writes,
            )?;
        *self.index.write() = Some(index);
        *log = Some(LogState {
            writer,
            disk_bytes: recovered.total_bytes,
            record_count: recovered.records.len() as u64,
        });
        Ok(())
    }

    fn not_open(&self) -> DiskError {
        DiskError::NotOpen { path: self.dir.clone() }
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, Vec<u8>>) -> DiskResult<T>) -> DiskResult<T> {
        let index = self.index.read();
        let index = index.as_ref().ok_or_else(|| self.not_open())?;
        f(index)
    }

    fn lookup(&self, key: &str) -> DiskResult<Option<Value>> {
        self.read(|index| index.get(key).map(|bytes| decode_value(key, bytes)).transpose())
    }

    /// Append `changes` as one log write, then apply them to the index.
    fn write_batch(&self, state: &mut LogState, changes: Vec<IndexChange>) -> DiskResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut bytes = Vec::new();
        let mut grows = false;
        for change in &changes {
            let record = match change {
                IndexChange::Put(key, value) => {
                    grows = true;
                    encode_record(Op::Put, key.as_bytes(), value, &self.config)?
                }
                IndexChange::Delete(key) => {
                    encode_record(Op::Delete, key.as_bytes(), b"", &self.config)?
                }
            };
            bytes.extend(record);
        }

        // Deletes are always accepted so a full store can shrink
        if grows {
            self.ensure_capacity(state, bytes.len() as u64)?;
        }

        state.writer.append(&bytes)?;
        state.disk_bytes += bytes.len() as u64;
        state.record_count += changes.len() as u64;

        let live = {
            let mut index = self.index.write();
            let index = index.as_mut().ok_or_else(|| self.not_open())?;
            for change in changes {
                match change {
                    IndexChange::Put(key, value) => {
                        index.insert(key, value);
                    }
                    IndexChange::Delete(key) => {
                        index.remove(&key);
                    }
                }
            }
            index.len() as u64
        };

        if needs_compaction(state.record_count, live, self.config.compaction_trigger_ratio) {
            // The write itself already succeeded
            if let Err(e) = self.checkpoint(state, false) {
                warn!("Background compaction of {} failed: {}", self.dir.display(), e);
            }
        }
        Ok(())
    }

    fn ensure_capacity(&self, state: &mut LogState, requested: u64) -> DiskResult<()> {
        let remaining = self.config.capacity_bytes.saturating_sub(state.disk_bytes);
        if requested <= remaining {
            return Ok(());
        }

        let live = self.read(|index| Ok(index.len() as u64))?;
        if state.record_count > live {
            debug!("Compacting {} before refusing a {} byte write", self.dir.display(), requested);
            self.checkpoint(state, false)?;
            let remaining = self.config.capacity_bytes.saturating_sub(state.disk_bytes);
            if requested <= remaining {
                return Ok(());
            }
        }

        Err(DiskError::CapacityExceeded {
            requested_bytes: requested,
            remaining_bytes: self.config.capacity_bytes.saturating_sub(state.disk_bytes),
        })
    }

    /// Rewrite the log as a single checkpoint file holding the live index,
    /// or nothing when `clear` is set.
    fn checkpoint(&self, state: &mut LogState, clear: bool) -> DiskResult<CompactionResult> {
        let sequence = state.writer.sequence() + 1;
        let (file_path, compacted_bytes, live_records) = {
            let empty = HashMap::new();
            let index = self.index.read();
            let index = index.as_ref().ok_or_else(|| self.not_open())?;
            let live = if clear { &empty } else { index };
            let (path, size) = write_checkpoint(&self.dir, sequence, live, &self.config)?;
            (path, size, live.len() as u64)
        };

        state.writer =
            LogWriter::open(
                &self.dir,
                sequence,
                self.config.rotation_size_bytes,
                self.config.durable_writes,
            )?;
        if clear {
            if let Some(index) = self.index.write().as_mut() {
                index.clear();
            }
        }
        remove_superseded(&self.dir, sequence)?;

        let result = CompactionResult {
            file_path,
            sequence,
            original_records: state.record_count,
            live_records,
            original_bytes: state.disk_bytes,
            compacted_bytes,
        };
        state.disk_bytes = compacted_bytes;
        state.record_count = live_records + 1;

        info!(
            "Compacted {}: {} -> {} records ({} bytes saved)",
            self.dir.display(),
            result.original_records,
            result.live_records,
            result.bytes_saved()
        );
        Ok(result)
    }

    /// Rewrite the log keeping only live records.
    pub fn compact(&self) -> DiskResult<CompactionResult> {
        let mut log = self.log.lock();
        let state = log.as_mut().ok_or_else(|| self.not_open())?;
        self.checkpoint(state, false)
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut LogState) -> DiskResult<T>) -> DiskResult<T> {
        let mut log = self.log.lock();
        let state = log.as_mut().ok_or_else(|| self.not_open())?;
        f(state)
    }

    fn put_values(&self, entries: Vec<(String, Value)>) -> DiskResult<()> {
        let mut changes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let encoded = encode_value(&key, &value)?;
            changes.push(IndexChange::Put(key, encoded));
        }
        self.with_log(|state| self.write_batch(state, changes))
    }

    fn delete_keys(&self, keys: &[String]) -> DiskResult<()> {
        self.with_log(|state| {
            let changes: Vec<IndexChange> = self.read(|index| {
                Ok(keys
                    .iter()
                    .filter(|key| index.contains_key(key.as_str()))
                    .map(|key| IndexChange::Delete(key.clone()))
                    .collect())
            })?;
            self.write_batch(state, changes)
        })
    }

    /// Merge each pair over its stored value while holding the writer lock, so
    /// no other write interleaves between the read and the append.
    fn merge_pairs(&self, pairs: Vec<MergePair>) -> DiskResult<()> {
        self.with_log(|state| {
            let mut changes = Vec::with_capacity(pairs.len());
            let mut merged_so_far: HashMap<String, Option<Value>> = HashMap::new();
            for pair in pairs {
                let existing = match merged_so_far.get(&pair.key) {
                    Some(value) => value.clone(),
                    None => self.lookup(&pair.key)?,
                };
                let merged =
                    apply_patch(existing.as_ref(), &pair.change, &pair.replace_null_patches);
                let change = match &merged {
                    Some(value) => {
                        IndexChange::Put(pair.key.clone(), encode_value(&pair.key, value)?)
                    }
                    None => IndexChange::Delete(pair.key.clone()),
                };
                changes.push(change);
                merged_so_far.insert(pair.key, merged);
            }
            self.write_batch(state, changes)
        })
    }
}

#[async_trait]
impl StorageProvider for DiskProvider {
    fn name(&self) -> &str {
        "disk"
    }

    async fn init(&self) -> StorageResult<()> {
        Ok(self.open_log()?)
    }

    async fn get_item(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.lookup(key)?)
    }

    async fn multi_get(&self, keys: &[String]) -> StorageResult<Vec<(String, Option<Value>)>> {
        let values = self.read(|index| {
            keys.iter()
                .map(|key| {
                    let value = index.get(key).map(|bytes| decode_value(key, bytes)).transpose()?;
                    Ok((key.clone(), value))
                })
                .collect::<DiskResult<Vec<_>>>()
        })?;
        Ok(values)
    }

    async fn set_item(&self, key: &str, value: Value) -> StorageResult<()> {
        validate_payload(key, &value)?;
        Ok(self.put_values(vec![(key.to_owned(), value)])?)
    }

    async fn multi_set(&self, entries: Vec<(String, Value)>) -> StorageResult<()> {
        for (key, value) in &entries {
            validate_payload(key, value)?;
        }
        Ok(self.put_values(entries)?)
    }

    async fn merge_item(
        &self,
        key: &str,
        change: Value,
        patches: &[ReplaceNullPatch],
    ) -> StorageResult<()> {
        let pair =
            MergePair { key: key.to_owned(), change, replace_null_patches: patches.to_vec() };
        Ok(self.merge_pairs(vec![pair])?)
    }

    async fn multi_merge(&self, pairs: Vec<MergePair>) -> StorageResult<()> {
        Ok(self.merge_pairs(pairs)?)
    }

    async fn remove_item(&self, key: &str) -> StorageResult<()> {
        Ok(self.delete_keys(&[key.to_owned()])?)
    }

    async fn remove_items(&self, keys: &[String]) -> StorageResult<()> {
        Ok(self.delete_keys(keys)?)
    }

    async fn get_all_keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.read(|index| Ok(index.keys().cloned().collect::<Vec<_>>()))?)
    }

    async fn clear(&self) -> StorageResult<()> {
        self.with_log(|state| self.checkpoint(state, true).map(|_| ()))?;
        Ok(())
    }

    async fn get_database_size(&self) -> StorageResult<DatabaseSize> {
        let bytes_used = self.with_log(|state| Ok(state.disk_bytes))?;
        let bytes_remaining = self.config.capacity_bytes.saturating_sub(bytes_used);
        Ok(DatabaseSize { bytes_used, bytes_remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn small() -> DiskConfig {
        DiskConfig::constrained().with_rotation_size(4096)
    }

    #[tokio::test]
    async fn test_operations_before_init_fail() {
        let tmp = TempDir::new().unwrap();
        let provider = DiskProvider::new(tmp.path(), small()).unwrap();

        let err = provider.get_item("k").await.unwrap_err();
        assert!(!err.is_fatal() && !err.is_quota());
        assert!(provider.stats().is_none());

        provider.init().await.unwrap();
        assert_eq!(provider.get_item("k").await.unwrap(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = DiskConfig::default().with_compaction_trigger(2.0);
        let result = DiskProvider::new(tmp.path(), config);
        assert!(matches!(result, Err(DiskError::Config(_))));
    }

    #[tokio::test]
    async fn test_merge_item_reads_stored_value() {
        let tmp = TempDir::new().unwrap();
        let provider = DiskProvider::open(tmp.path(), small()).unwrap();

        provider.set_item("k", json!({"a": 1, "b": {"c": 1}})).await.unwrap();
        provider.merge_item("k", json!({"b": {"d": 2}}), &[]).await.unwrap();
        assert_eq!(
            provider.get_item("k").await.unwrap(),
            Some(json!({"a": 1, "b": {"c": 1, "d": 2}}))
        );

        provider.merge_item("k", Value::Null, &[]).await.unwrap();
        assert_eq!(provider.get_item("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multi_merge_chains_same_key() {
        let tmp = TempDir::new().unwrap();
        let provider = DiskProvider::open(tmp.path(), small()).unwrap();

        provider
            .multi_merge(vec![
                MergePair {
                    key: "k".into(),
                    change: json!({"a": 1}),
                    replace_null_patches: vec![],
                },
                MergePair {
                    key: "k".into(),
                    change: json!({"b": 2}),
                    replace_null_patches: vec![],
                },
            ])
            .await
            .unwrap();
        assert_eq!(provider.get_item("k").await.unwrap(), Some(json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn test_removing_missing_keys_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let provider = DiskProvider::open(tmp.path(), small()).unwrap();

        provider.remove_items(&["missing".into()]).await.unwrap();
        assert_eq!(provider.stats().unwrap().records, 0);
    }

    #[tokio::test]
    async fn test_null_rejected_as_corrupt() {
        let tmp = TempDir::new().unwrap();
        let provider = DiskProvider::open(tmp.path(), small()).unwrap();
        assert!(provider.set_item("k", Value::Null).await.unwrap_err().is_fatal());
    }
}
