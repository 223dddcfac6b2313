//! Write buffer: staged writes waiting for the backend
//!
//! Every persisted mutation is staged here first, after the cache has been
//! updated. Writes to the same key made before the next flush are coalesced
//! into one backend operation:
//!
//! - a set or remove replaces whatever is staged
//! - a merge onto a staged set is applied in memory and stays a set
//! - a merge onto a staged merge composes both changes
//! - a merge onto a staged remove becomes a set of the merge applied to nothing
//!
//! Each writer gets a receiver that resolves with the outcome of the flush
//! that carried its write. The flush loop itself lives in the store, which
//! owns the retry and eviction policy; this type only tracks what is dirty.

use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::StoreResult;
use crate::merge::MarkedChanges;

/// Receives the outcome of the flush that persisted a write.
pub type WriteReceiver = oneshot::Receiver<StoreResult<()>>;

/// A write waiting for the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Store the full value
    Set(Value),
    /// Merge the change into whatever the backend holds
    Merge(MarkedChanges),
    /// Delete the key
    Remove,
}

impl PendingWrite {
    /// Coalesce `next` onto `self`.
    fn then(self, next: PendingWrite) -> PendingWrite {
        match (self, next) {
            (_, PendingWrite::Set(value)) => PendingWrite::Set(value),
            (_, PendingWrite::Remove) => PendingWrite::Remove,
            (PendingWrite::Merge(staged), PendingWrite::Merge(change)) => {
                PendingWrite::Merge(staged.then(change))
            }
            (PendingWrite::Set(value), PendingWrite::Merge(change)) => {
                full_value(change.apply_to(Some(&value)))
            }
            (PendingWrite::Remove, PendingWrite::Merge(change)) => {
                full_value(change.apply_to(None))
            }
        }
    }
}

fn full_value(value: Option<Value>) -> PendingWrite {
    match value {
        Some(value) => PendingWrite::Set(value),
        None => PendingWrite::Remove,
    }
}

/// A dirty key taken out of the buffer for flushing.
#[derive(Debug)]
pub struct StagedWrite {
    pub key: String,
    pub write: PendingWrite,
    waiters: Vec<oneshot::Sender<StoreResult<()>>>,
}

impl StagedWrite {
    /// Report the flush outcome to everyone whose write was coalesced here.
    pub fn resolve(self, result: StoreResult<()>) {
        for waiter in self.waiters {
            // A dropped receiver just means nobody is waiting
            let _ = waiter.send(result.clone());
        }
    }
}

struct Staged {
    write: PendingWrite,
    waiters: Vec<oneshot::Sender<StoreResult<()>>>,
}

/// Tracks which keys have staged writes not yet handed to the backend.
pub struct WriteBuffer {
    /// Staged writes in first-staged order
    dirty: Mutex<IndexMap<String, Staged>>,
    /// Held for the duration of one flush so flushes never interleave
    flush_lock: tokio::sync::Mutex<()>,
    /// Total number of writes flushed since the store started
    total_flushed: AtomicU64,
    /// Total number of flush cycles completed
    total_cycles: AtomicU64,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            dirty: Mutex::new(IndexMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            total_flushed: AtomicU64::new(0),
            total_cycles: AtomicU64::new(0),
        }
    }

    /// Stage a write for `key`, coalescing with anything already staged.
    pub fn stage(&self, key: &str, write: PendingWrite) -> WriteReceiver {
        let (sender, receiver) = oneshot::channel();
        let mut dirty = self.dirty.lock();
        match dirty.get_mut(key) {
            Some(staged) => {
                let previous = std::mem::replace(&mut staged.write, PendingWrite::Remove);
                staged.write = previous.then(write);
                staged.waiters.push(sender);
            }
            None => {
                dirty.insert(key.to_owned(), Staged { write, waiters: vec![sender] });
            }
        }
        receiver
    }

    pub fn stage_set(&self, key: &str, value: Value) -> WriteReceiver {
        self.stage(key, PendingWrite::Set(value))
    }

    pub fn stage_merge(&self, key: &str, change: MarkedChanges) -> WriteReceiver {
        self.stage(key, PendingWrite::Merge(change))
    }

    pub fn stage_remove(&self, key: &str) -> WriteReceiver {
        self.stage(key, PendingWrite::Remove)
    }

    /// Take all staged writes, leaving the buffer empty.
    pub fn take_dirty(&self) -> Vec<StagedWrite> {
        let mut dirty = self.dirty.lock();
        std::mem::take(&mut *dirty)
            .into_iter()
            .map(|(key, staged)| StagedWrite { key, write: staged.write, waiters: staged.waiters })
            .collect()
    }

    /// Number of keys currently staged.
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// The write currently staged for `key`, so reads can see past the backend.
    pub fn staged(&self, key: &str) -> Option<PendingWrite> {
        self.dirty.lock().get(key).map(|staged| staged.write.clone())
    }

    /// Drop staged writes for `keys` without persisting them. Their writers
    /// are told the write succeeded; a later write superseded it.
    pub fn discard<'a, I: IntoIterator<Item = &'a str>>(&self, keys: I) {
        let discarded: Vec<Staged> = {
            let mut dirty = self.dirty.lock();
            keys.into_iter().filter_map(|key| dirty.shift_remove(key)).collect()
        };
        for staged in discarded {
            for waiter in staged.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// Serialize flushes.
    pub async fn flush_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.flush_lock.lock().await
    }

    /// Total writes flushed since the store started.
    pub fn total_flushed(&self) -> u64 {
        self.total_flushed.load(Ordering::Relaxed)
    }

    /// Total flush cycles completed.
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    /// Record that a flush cycle completed.
    pub fn record_cycle(&self, flushed_count: u64) {
        self.total_flushed.fetch_add(flushed_count, Ordering::Relaxed);
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("dirty", &self.dirty_count())
            .field("total_flushed", &self.total_flushed())
            .field("total_cycles", &self.total_cycles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StorageError, StoreError};
    use crate::merge::merge_and_mark_changes;
    use serde_json::json;

    fn change(value: Value) -> MarkedChanges {
        MarkedChanges::from_value(&value)
    }

    #[test]
    fn test_write_buffer_basics() {
        let buffer = WriteBuffer::new();
        assert_eq!(buffer.dirty_count(), 0);

        let _a = buffer.stage_set("key1", json!(1));
        let _b = buffer.stage_set("key2", json!(2));
        assert_eq!(buffer.dirty_count(), 2);

        // Same key twice doesn't increase count
        let _c = buffer.stage_set("key1", json!(3));
        assert_eq!(buffer.dirty_count(), 2);

        let taken = buffer.take_dirty();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].key, "key1");
        assert_eq!(taken[0].write, PendingWrite::Set(json!(3)));
        assert_eq!(buffer.dirty_count(), 0);
    }

    #[test]
    fn test_write_buffer_stats() {
        let buffer = WriteBuffer::new();
        assert_eq!(buffer.total_flushed(), 0);
        assert_eq!(buffer.total_cycles(), 0);

        buffer.record_cycle(5);
        buffer.record_cycle(3);
        assert_eq!(buffer.total_flushed(), 8);
        assert_eq!(buffer.total_cycles(), 2);
    }

    #[test]
    fn test_coalescing_rules() {
        let buffer = WriteBuffer::new();

        let _ = buffer.stage_set("a", json!({"x": 1}));
        let _ = buffer.stage_merge("a", change(json!({"y": 2})));

        let _ = buffer.stage_merge("b", change(json!({"x": {"p": 1}})));
        let _ = buffer.stage_merge("b", change(json!({"x": null})));
        let _ = buffer.stage_merge("b", change(json!({"x": {"q": 2}})));

        let _ = buffer.stage_remove("c");
        let _ = buffer.stage_merge("c", change(json!({"z": 1})));

        let _ = buffer.stage_merge("d", change(json!({"z": 1})));
        let _ = buffer.stage_remove("d");

        let taken = buffer.take_dirty();
        assert_eq!(taken[0].write, PendingWrite::Set(json!({"x": 1, "y": 2})));
        let changes = [json!({"x": {"p": 1}}), json!({"x": null}), json!({"x": {"q": 2}})];
        let expected = merge_and_mark_changes(&changes);
        assert_eq!(Some(&taken[1].write), expected.map(PendingWrite::Merge).as_ref());
        assert_eq!(taken[2].write, PendingWrite::Set(json!({"z": 1})));
        assert_eq!(taken[3].write, PendingWrite::Remove);
    }

    #[test]
    fn test_staged_lookup() {
        let buffer = WriteBuffer::new();
        let _ = buffer.stage_set("a", json!(1));
        let _ = buffer.stage_remove("b");
        let _ = buffer.stage_merge("c", change(json!({"x": 1})));
        assert_eq!(buffer.staged("a"), Some(PendingWrite::Set(json!(1))));
        assert_eq!(buffer.staged("b"), Some(PendingWrite::Remove));
        assert_eq!(buffer.staged("c"), Some(PendingWrite::Merge(change(json!({"x": 1})))));
        assert_eq!(buffer.staged("d"), None);
    }

    #[tokio::test]
    async fn test_waiters_receive_flush_outcome() {
        let buffer = WriteBuffer::new();
        let first = buffer.stage_set("a", json!(1));
        let second = buffer.stage_set("a", json!(2));
        let discarded = buffer.stage_set("b", json!(1));

        buffer.discard(["b"]);
        assert_eq!(discarded.await.unwrap(), Ok(()));

        let error = StoreError::Storage(StorageError::corrupt(Some("a"), "bad"));
        for staged in buffer.take_dirty() {
            staged.resolve(Err(error.clone()));
        }
        assert_eq!(first.await.unwrap(), Err(error.clone()));
        assert_eq!(second.await.unwrap(), Err(error));
    }
}
