//! Storage backend contract
//!
//! The store never talks to a concrete backend; it drives a
//! [`StorageProvider`]. Backends classify their own failures into
//! [`StorageError`] variants. Batch operations default to loops over the
//! single-key operations, so a minimal backend only implements those.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::merge::{apply_patch, ReplaceNullPatch};

/// Callback invoked when another instance changed `key` (`None`: removed).
pub type StorageChangeCallback = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

/// Space accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSize {
    /// Bytes occupied by stored data
    pub bytes_used: u64,
    /// Bytes still available, `u64::MAX` when unbounded
    pub bytes_remaining: u64,
}

/// One entry of a batched merge: a flattened change and its replace-null patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePair {
    pub key: String,
    pub change: Value,
    pub replace_null_patches: Vec<ReplaceNullPatch>,
}

/// Asynchronous key/value backend.
///
/// Implementations must be safe to share between tasks. Values are JSON; a
/// missing key reads as `None`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Human-readable backend name, used in logs.
    fn name(&self) -> &str;

    /// Prepare the backend. A failing `init` makes the store fall back to memory.
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get_item(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn multi_get(&self, keys: &[String]) -> StorageResult<Vec<(String, Option<Value>)>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push((key.clone(), self.get_item(key).await?));
        }
        Ok(values)
    }

    async fn set_item(&self, key: &str, value: Value) -> StorageResult<()>;

    async fn multi_set(&self, entries: Vec<(String, Value)>) -> StorageResult<()> {
        for (key, value) in entries {
            self.set_item(&key, value).await?;
        }
        Ok(())
    }

    /// Merge `change` into the stored value, then overwrite each patch path.
    ///
    /// The default reads, applies [`apply_patch`] and writes back.
    async fn merge_item(
        &self,
        key: &str,
        change: Value,
        patches: &[ReplaceNullPatch],
    ) -> StorageResult<()> {
        let existing = self.get_item(key).await?;
        match apply_patch(existing.as_ref(), &change, patches) {
            Some(merged) => self.set_item(key, merged).await,
            None => self.remove_item(key).await,
        }
    }

    async fn multi_merge(&self, pairs: Vec<MergePair>) -> StorageResult<()> {
        for pair in pairs {
            self.merge_item(&pair.key, pair.change, &pair.replace_null_patches).await?;
        }
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> StorageResult<()>;

    async fn remove_items(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.remove_item(key).await?;
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> StorageResult<Vec<String>>;

    async fn clear(&self) -> StorageResult<()>;

    async fn get_database_size(&self) -> StorageResult<DatabaseSize> {
        Ok(DatabaseSize { bytes_used: 0, bytes_remaining: u64::MAX })
    }

    /// Register for changes made by other instances sharing this backend.
    /// Backends without such a channel ignore the call.
    fn keep_instances_sync(&self, _on_change: StorageChangeCallback) {}
}

/// Reject payloads a JSON backend cannot store faithfully.
pub fn validate_payload(key: &str, value: &Value) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::corrupt(None, "empty key"));
    }
    if value.is_null() {
        return Err(StorageError::corrupt(Some(key), "null is not a storable value"));
    }
    Ok(())
}
