//! In-memory storage backend
//!
//! Used for tests, for RAM-only deployments and as the fallback when the
//! configured backend fails to initialize. Several instances can share one
//! map (see [`MemoryProvider::new_instance`]); a write through one instance is
//! reported to the sync listeners of the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::storage::{validate_payload, DatabaseSize, StorageChangeCallback, StorageProvider};

#[derive(Default)]
struct Items {
    values: HashMap<String, Value>,
    /// Sum of `entry_size` over `values`
    bytes_used: u64,
}

#[derive(Default)]
struct SharedState {
    items: Mutex<Items>,
    listeners: Mutex<Vec<(u64, StorageChangeCallback)>>,
    next_instance: AtomicU64,
}

/// Backend keeping every item in a shared hash map.
pub struct MemoryProvider {
    /// Distinguishes instances sharing `shared` so writers skip their own listener
    instance_id: u64,
    shared: Arc<SharedState>,
    /// Byte limit across all items; `None` is unbounded
    capacity_bytes: Option<u64>,
}

fn entry_size(key: &str, value: &Value) -> StorageResult<u64> {
    let encoded =
        serde_json::to_vec(value).map_err(|e| StorageError::corrupt(Some(key), e.to_string()))?;
    Ok((key.len() + encoded.len()) as u64)
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self { instance_id: 0, shared: Arc::new(SharedState::default()), capacity_bytes: None }
    }

    /// A provider that reports `QuotaExceeded` once `capacity_bytes` would be exceeded.
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self { capacity_bytes: Some(capacity_bytes), ..Self::new() }
    }

    /// Another handle on the same data, as a second client instance would have.
    pub fn new_instance(&self) -> Self {
        let instance_id = self.shared.next_instance.fetch_add(1, Ordering::Relaxed) + 1;
        Self { instance_id, shared: Arc::clone(&self.shared), capacity_bytes: self.capacity_bytes }
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.shared.items.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronous peek, bypassing the async contract.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.shared.items.lock().values.get(key).cloned()
    }

    fn broadcast(&self, key: &str, value: Option<Value>) {
        let listeners: Vec<StorageChangeCallback> = self
            .shared
            .listeners
            .lock()
            .iter()
            .filter(|(id, _)| *id != self.instance_id)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for listener in listeners {
            listener(key, value.clone());
        }
    }

    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        validate_payload(key, &value)?;
        let size = entry_size(key, &value)?;
        {
            let mut items = self.shared.items.lock();
            let previous = match items.values.get(key) {
                Some(old) => entry_size(key, old)?,
                None => 0,
            };
            let projected = items.bytes_used - previous + size;
            if let Some(capacity) = self.capacity_bytes {
                if projected > capacity {
                    return Err(StorageError::quota(format!(
                        "writing '{}' needs {} bytes, {} of {} in use",
                        key, size, items.bytes_used, capacity
                    )));
                }
            }
            items.bytes_used = projected;
            items.values.insert(key.to_owned(), value.clone());
        }
        self.broadcast(key, Some(value));
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let removed = {
            let mut items = self.shared.items.lock();
            match items.values.remove(key) {
                Some(old) => {
                    let size = entry_size(key, &old)?;
                    items.bytes_used = items.bytes_used.saturating_sub(size);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.broadcast(key, None);
        }
        Ok(())
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_item(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.peek(key))
    }

    async fn set_item(&self, key: &str, value: Value) -> StorageResult<()> {
        self.put(key, value)
    }

    async fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.delete(key)
    }

    async fn get_all_keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.shared.items.lock().values.keys().cloned().collect())
    }

    async fn clear(&self) -> StorageResult<()> {
        let keys: Vec<String> = {
            let mut items = self.shared.items.lock();
            items.bytes_used = 0;
            items.values.drain().map(|(key, _)| key).collect()
        };
        for key in keys {
            self.broadcast(&key, None);
        }
        Ok(())
    }

    async fn get_database_size(&self) -> StorageResult<DatabaseSize> {
        let bytes_used = self.shared.items.lock().bytes_used;
        let bytes_remaining = match self.capacity_bytes {
            Some(capacity) => capacity.saturating_sub(bytes_used),
            None => u64::MAX,
        };
        Ok(DatabaseSize { bytes_used, bytes_remaining })
    }

    fn keep_instances_sync(&self, on_change: StorageChangeCallback) {
        self.shared.listeners.lock().push((self.instance_id, on_change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_basic_operations() {
        let provider = MemoryProvider::new();
        provider.set_item("a", json!({"x": 1})).await.unwrap();
        assert_eq!(provider.get_item("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(provider.get_item("b").await.unwrap(), None);

        provider.remove_item("a").await.unwrap();
        assert!(provider.is_empty());

        let err = provider.set_item("a", Value::Null).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let provider = MemoryProvider::with_capacity(16);
        provider.set_item("a", json!("0123456789")).await.unwrap();
        let err = provider.set_item("b", json!("0123456789")).await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(provider.peek("b"), None);

        // Overwriting with a smaller value frees room
        provider.set_item("a", json!(1)).await.unwrap();
        provider.set_item("b", json!("012345")).await.unwrap();

        let size = provider.get_database_size().await.unwrap();
        assert_eq!(size.bytes_used + size.bytes_remaining, 16);
    }

    #[tokio::test]
    async fn test_instances_share_data_and_broadcast() {
        let first = MemoryProvider::new();
        let second = first.new_instance();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        second.keep_instances_sync(Arc::new(move |key, value| {
            sink.lock().push((key.to_owned(), value));
        }));
        let own = Arc::clone(&seen);
        first.keep_instances_sync(Arc::new(move |key, _| {
            own.lock().push((format!("own:{}", key), None));
        }));

        first.set_item("k", json!(1)).await.unwrap();
        assert_eq!(second.get_item("k").await.unwrap(), Some(json!(1)));
        first.clear().await.unwrap();

        assert_eq!(*seen.lock(), vec![("k".to_string(), Some(json!(1))), ("k".to_string(), None)]);
    }
}
