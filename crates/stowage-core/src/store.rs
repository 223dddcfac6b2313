//! Store: the persistence coordinator
//!
//! `Store` owns the cache, the connection manager and the write buffer, and
//! drives a [`StorageProvider`].
//!
//! **Write path**: validate, apply to the cache synchronously, queue
//! notifications, stage the backend write. The caller then settles: yield
//! once so writes issued in the same burst can join, deliver the queued
//! notifications, flush staged writes, and wait for the flush carrying its
//! own write.
//!
//! **Read path**: cache first; a miss shares one backend read per key.
//!
//! **RAM-only keys** take the same path minus the backend.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock as GateLock};
use tracing::{debug, error, info, warn};

use crate::batch::{NotificationBatcher, Pending};
use crate::cache::{Cache, CacheLookup, CollectionSnapshot};
use crate::computed::{ComputedKey, Dependency};
use crate::config::{DeliveryMode, StoreConfig};
use crate::connection::{
    ConnectOptions, ConnectOutcome, ConnectionHandle, ConnectionManager, Delivery,
};
use crate::error::{StorageResult, StoreError, StoreResult};
use crate::keys::{is_collection_member_key, KeyMatcher, KeyRegistry};
use crate::memory::MemoryProvider;
use crate::merge::{
    check_compatibility, merge_and_mark_changes, merge_value, remove_nested_nulls, MarkedChanges,
    MergeOptions,
};
use crate::storage::{MergePair, StorageProvider};
use crate::tasks::TaskRegistry;
use crate::update::{Operation, Update};
use crate::write_buffer::{PendingWrite, StagedWrite, WriteBuffer, WriteReceiver};

/// Merges for one key waiting for the key's current value.
struct PendingMerge {
    /// Changes in arrival order
    changes: Vec<Value>,
    /// Callers that joined after the first change
    waiters: Vec<oneshot::Sender<StoreResult<()>>>,
}

/// A computed key whose dependencies are subscribed.
struct ComputedState {
    key: ComputedKey,
    /// Set once every dependency is connected; recomputation waits for it
    active: bool,
}

struct StoreInner {
    config: StoreConfig,
    keys: KeyRegistry,
    ram_only: KeyMatcher,
    skippable_member_ids: HashSet<String>,
    cache: Cache,
    connections: ConnectionManager,
    batcher: NotificationBatcher,
    writes: WriteBuffer,
    /// Swapped for a memory provider if the configured one fails to initialize
    provider: RwLock<Arc<dyn StorageProvider>>,
    merge_queue: Mutex<HashMap<String, PendingMerge>>,
    computed: Mutex<HashMap<String, ComputedState>>,
    /// Write-held until `init` finishes. Operations pass through a read
    /// guard, so the ones issued earlier are released first.
    init_gate: Arc<GateLock<()>>,
    init_guard: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    ready: AtomicBool,
}

/// A persisted key/value store with subscriptions.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Build a store over `provider`. Nothing touches the backend until [`Store::init`].
    pub fn new(config: StoreConfig, provider: Arc<dyn StorageProvider>) -> StoreResult<Self> {
        config.validate().map_err(StoreError::Config)?;

        let keys = KeyRegistry::new(config.collection_keys.iter().cloned());
        let ram_only = KeyMatcher::new(&config.ram_only_keys, &keys);
        let cache = Cache::new(keys.clone(), config.max_cached_keys);
        cache.set_eviction_allow_list(KeyMatcher::new(&config.evictable_keys, &keys));
        let init_gate = Arc::new(GateLock::new(()));
        let init_guard = Arc::clone(&init_gate).try_write_owned().ok();

        Ok(Self {
            inner: Arc::new(StoreInner {
                skippable_member_ids: config
                    .skippable_collection_member_ids
                    .iter()
                    .cloned()
                    .collect(),
                batcher: NotificationBatcher::new(config.delivery),
                keys,
                ram_only,
                cache,
                connections: ConnectionManager::new(),
                writes: WriteBuffer::new(),
                provider: RwLock::new(provider),
                merge_queue: Mutex::new(HashMap::new()),
                computed: Mutex::new(HashMap::new()),
                init_gate,
                init_guard: Mutex::new(init_guard),
                ready: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Initialize the backend, load known keys and default key states, then
    /// release every operation that was waiting for initialization, in the
    /// order they were issued.
    pub async fn init(&self) -> StoreResult<()> {
        // Released on every return path, so waiting operations never hang
        let _init_guard = self.inner.init_guard.lock().take();
        let provider = self.provider();
        if let Err(error) = provider.init().await {
            warn!(
                "Storage provider {} failed to initialize, falling back to memory-only storage. Error: {}",
                provider.name(),
                error
            );
            *self.inner.provider.write() = Arc::new(MemoryProvider::new());
        }
        if self.inner.config.keep_instances_sync {
            self.subscribe_to_instance_changes();
        }

        let keys = self.load_all_keys().await;
        for key in &keys {
            self.inner.cache.add_to_accessed_keys(key);
        }

        self.initialize_default_key_states().await?;

        match self.provider().get_database_size().await {
            Ok(size) => info!(
                "Storage Quota Check -- bytesUsed: {} bytesRemaining: {}",
                size.bytes_used, size.bytes_remaining
            ),
            Err(error) => warn!("Unable to get database size. Error: {}", error),
        }

        self.inner.ready.store(true, Ordering::Release);
        self.flush_notifications();
        debug!(keys = keys.len(), provider = self.provider().name(), "store initialized");
        Ok(())
    }

    async fn initialize_default_key_states(&self) -> StoreResult<()> {
        let defaults = &self.inner.config.default_key_states;
        if defaults.is_empty() {
            return Ok(());
        }
        let persisted: Vec<String> = defaults
            .keys()
            .filter(|key| !self.is_ram_only(key))
            .cloned()
            .collect();
        let stored: Map<String, Value> = match self.provider().multi_get(&persisted).await {
            Ok(pairs) => pairs
                .into_iter()
                .filter_map(|(key, value)| value.filter(|v| !v.is_null()).map(|value| (key, value)))
                .collect(),
            Err(error) => {
                warn!("Unable to read default keys from storage. Error: {}", error);
                Map::new()
            }
        };

        let merged = merge_value(
            Some(&Value::Object(stored)),
            Some(&Value::Object(defaults.clone())),
            MergeOptions::default(),
        )
        .unwrap_or_else(|| Value::Object(Map::new()));
        self.inner.cache.merge(&merged)?;
        if let Value::Object(entries) = &merged {
            for key in entries.keys() {
                let value = self.inner.cache.get(key);
                self.schedule_notifications(key, value.as_ref());
            }
        }
        Ok(())
    }

    /// True once `init` has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    async fn wait_until_ready(&self) {
        drop(self.inner.init_gate.read().await);
    }

    fn provider(&self) -> Arc<dyn StorageProvider> {
        Arc::clone(&self.inner.provider.read())
    }

    /// Direct access to the cache.
    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_ram_only(&self, key: &str) -> bool {
        self.inner.ram_only.matches(key)
    }

    fn is_skippable_member(&self, key: &str) -> bool {
        if self.inner.skippable_member_ids.is_empty() {
            return false;
        }
        match self.inner.keys.split_collection_member_key(key) {
            Ok((_, member_id)) => self.inner.skippable_member_ids.contains(member_id),
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Current value of `key`, reading the backend on a cache miss.
    ///
    /// A backend failure is logged and reads as absent.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.wait_until_ready().await;
        self.get_value(key).await
    }

    async fn get_value(&self, key: &str) -> Option<Value> {
        let cache = &self.inner.cache;
        match cache.lookup(key) {
            CacheLookup::Value(value) => {
                cache.add_to_accessed_keys(key);
                return Some(value);
            }
            CacheLookup::Absent => return None,
            CacheLookup::Unknown => {}
        }
        // A stale persisted value of a RAM-only key is never read back
        if self.is_ram_only(key) || self.is_computed(key) {
            return None;
        }

        let store = self.clone();
        let owned_key = key.to_owned();
        let task = cache.capture_task(&TaskRegistry::get_task_id(key), async move {
            store.read_from_storage(&owned_key).await
        });
        let value = task.await;

        if cache.lookup(key) == CacheLookup::Unknown {
            cache.set(key, value);
        }
        cache.add_to_accessed_keys(key);
        self.trim_cache();
        cache.get(key)
    }

    async fn read_from_storage(&self, key: &str) -> Option<Value> {
        let staged = self.inner.writes.staged(key);
        match &staged {
            Some(PendingWrite::Set(value)) => return Some(value.clone()),
            Some(PendingWrite::Remove) => return None,
            _ => {}
        }
        let stored = match self.provider().get_item(key).await {
            Ok(value) => value.filter(|value| !value.is_null()),
            Err(error) => {
                info!("Unable to get item from persistent storage. Key: {} Error: {}", key, error);
                None
            }
        };
        match staged {
            Some(PendingWrite::Merge(change)) => change.apply_to(stored.as_ref()),
            _ => stored,
        }
    }

    /// Load `keys` into the cache, reading the backend for the uncached ones concurrently.
    async fn preload(&self, keys: Vec<String>) {
        let unknown: Vec<String> = keys
            .into_iter()
            .filter(|key| self.inner.cache.lookup(key) == CacheLookup::Unknown)
            .collect();
        if unknown.is_empty() {
            return;
        }
        join_all(unknown.iter().map(|key| self.get_value(key))).await;
    }

    fn trim_cache(&self) {
        let evicted = self.inner.cache.remove_least_recently_used_keys();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted least recently used keys from cache");
        }
    }

    /// Every known key: those in storage plus those written since.
    pub async fn get_all_keys(&self) -> BTreeSet<String> {
        self.wait_until_ready().await;
        self.load_all_keys().await
    }

    async fn load_all_keys(&self) -> BTreeSet<String> {
        if self.inner.cache.keys_loaded() {
            return self.inner.cache.get_all_keys();
        }
        let provider = self.provider();
        let task = self.inner.cache.capture_task(TaskRegistry::GET_ALL_KEYS, async move {
            match provider.get_all_keys().await {
                Ok(keys) => keys,
                Err(error) => {
                    warn!("Unable to get keys from persistent storage. Error: {}", error);
                    Vec::new()
                }
            }
        });
        let stored = task.await;
        let mut known = self.inner.cache.get_all_keys();
        known.extend(stored);
        self.inner.cache.set_all_keys(known.iter().cloned());
        known
    }

    /// Memoized snapshot of a collection's cached members.
    pub fn get_collection(&self, collection_key: &str) -> Option<CollectionSnapshot> {
        self.inner.cache.get_collection_data(collection_key)
    }

    /// Known member keys of `collection_key`, loading the key list if needed.
    async fn known_members(&self, collection_key: &str) -> Vec<String> {
        self.load_all_keys()
            .await
            .into_iter()
            .filter(|key| self.inner.keys.owning_collection(key) == Some(collection_key))
            .collect()
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Replace the value of `key`. `None` is a no-op; `null` removes the key.
    pub async fn set(&self, key: &str, value: Option<Value>) -> StoreResult<()> {
        self.wait_until_ready().await;
        let Some(value) = value else {
            return Ok(());
        };
        let receivers: Vec<WriteReceiver> = self.apply_set(key, value).into_iter().collect();
        self.settle_and_wait(receivers).await
    }

    /// Set several keys at once.
    pub async fn multi_set(&self, entries: Map<String, Value>) -> StoreResult<()> {
        self.wait_until_ready().await;
        let receivers: Vec<WriteReceiver> =
            entries.into_iter().filter_map(|(key, value)| self.apply_set(&key, value)).collect();
        self.settle_and_wait(receivers).await
    }

    /// Merge `changes` into `key`.
    ///
    /// Merges for one key issued while its current value is being read are
    /// queued and applied together, in order, once the value is known.
    /// `None` is a no-op; `null` removes the key.
    pub async fn merge(&self, key: &str, changes: Option<Value>) -> StoreResult<()> {
        self.wait_until_ready().await;
        let Some(change) = changes else {
            return Ok(());
        };
        if self.is_skippable_member(key) {
            return Ok(());
        }

        let follower = {
            let mut queue = self.inner.merge_queue.lock();
            match queue.get_mut(key) {
                Some(pending) => {
                    let (sender, receiver) = oneshot::channel();
                    pending.changes.push(change);
                    pending.waiters.push(sender);
                    Some(receiver)
                }
                None => {
                    let pending = PendingMerge { changes: vec![change], waiters: Vec::new() };
                    queue.insert(key.to_owned(), pending);
                    None
                }
            }
        };
        if let Some(receiver) = follower {
            return receiver.await.unwrap_or(Ok(()));
        }

        self.get_value(key).await;
        // A `set` in the meantime superseded the queued changes
        let Some(pending) = self.inner.merge_queue.lock().remove(key) else {
            return Ok(());
        };
        let existing = self.inner.cache.get(key);
        let receivers: Vec<WriteReceiver> =
            self.apply_merge(key, existing, pending.changes).into_iter().collect();
        let result = self.settle_and_wait(receivers).await;
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    /// Merge members into a collection. Members that do not belong to
    /// `collection_key` are logged and dropped; `null` members are removed.
    pub async fn merge_collection(
        &self,
        collection_key: &str,
        members: Map<String, Value>,
    ) -> StoreResult<()> {
        self.wait_until_ready().await;
        let members = self.validate_collection("mergeCollection", collection_key, members)?;
        if members.is_empty() {
            return Ok(());
        }
        self.preload(members.keys().cloned().collect()).await;
        let receivers = self.apply_merge_collection(collection_key, members);
        self.settle_and_wait(receivers).await
    }

    /// Replace a collection: members absent from `members` are removed.
    pub async fn set_collection(
        &self,
        collection_key: &str,
        members: Map<String, Value>,
    ) -> StoreResult<()> {
        self.wait_until_ready().await;
        let members = self.validate_collection("setCollection", collection_key, members)?;
        let existing = self.known_members(collection_key).await;
        self.preload(existing).await;
        let receivers = self.apply_set_collection(collection_key, members);
        self.settle_and_wait(receivers).await
    }

    /// Apply a list of update records.
    ///
    /// Invalid records are logged and skipped. A `clear` runs before the
    /// rest. All cache changes happen before any notification is delivered.
    pub async fn update(&self, updates: Vec<Update>) -> StoreResult<()> {
        self.wait_until_ready().await;
        let mut operations = Vec::with_capacity(updates.len());
        for update in &updates {
            match update.validate() {
                Ok(operation) => operations.push(operation),
                Err(error) => warn!("{}", error),
            }
        }

        if operations.iter().any(|operation| *operation == Operation::Clear) {
            self.clear_keys(&[]).await?;
        }

        let mut to_load = Vec::new();
        for operation in &operations {
            match operation {
                Operation::Merge { key, .. } => to_load.push(key.clone()),
                Operation::MergeCollection { members, .. } => {
                    to_load.extend(members.keys().cloned())
                }
                Operation::SetCollection { key, .. } => {
                    to_load.extend(self.known_members(key).await)
                }
                _ => {}
            }
        }
        self.preload(to_load).await;

        let mut receivers = Vec::new();
        for operation in operations {
            match operation {
                Operation::Set { key, value } => {
                    if let Some(value) = value {
                        receivers.extend(self.apply_set(&key, value));
                    }
                }
                Operation::Merge { key, value } => {
                    if let Some(value) = value {
                        receivers.extend(self.enqueue_or_apply_merge(&key, value));
                    }
                }
                Operation::MultiSet(entries) => {
                    for (key, value) in entries {
                        receivers.extend(self.apply_set(&key, value));
                    }
                }
                Operation::MergeCollection { key, members } => {
                    match self.validate_collection("mergeCollection", &key, members) {
                        Ok(members) => receivers.extend(self.apply_merge_collection(&key, members)),
                        Err(error) => warn!("{}", error),
                    }
                }
                Operation::SetCollection { key, members } => {
                    match self.validate_collection("setCollection", &key, members) {
                        Ok(members) => receivers.extend(self.apply_set_collection(&key, members)),
                        Err(error) => warn!("{}", error),
                    }
                }
                Operation::Clear => {}
            }
        }
        self.settle_and_wait(receivers).await
    }

    /// Reset every key not covered by `keys_to_preserve` to its default
    /// value, or remove it. Only observers whose value changes are notified.
    pub async fn clear(&self, keys_to_preserve: &[String]) -> StoreResult<()> {
        self.wait_until_ready().await;
        self.clear_keys(keys_to_preserve).await
    }

    async fn clear_keys(&self, keys_to_preserve: &[String]) -> StoreResult<()> {
        let defaults = &self.inner.config.default_key_states;
        let mut keys = self.load_all_keys().await;
        keys.extend(defaults.keys().cloned());

        let preserved = |key: &str| {
            keys_to_preserve
                .iter()
                .any(|preserve| self.inner.keys.is_key_match(preserve, key))
        };
        let to_reset: Vec<String> = keys.into_iter().filter(|key| !preserved(key)).collect();

        self.inner.writes.discard(to_reset.iter().map(String::as_str));
        let mut receivers = Vec::new();
        for key in &to_reset {
            self.clear_pending_merges(key);
            let default = defaults.get(key).cloned();
            if self.inner.cache.has_value_changed(key, default.as_ref()) {
                self.schedule_notifications(key, default.as_ref());
            }
            match default {
                Some(value) => {
                    self.inner.cache.set(key, Some(value.clone()));
                    if !self.is_ram_only(key) {
                        receivers.push(self.inner.writes.stage_set(key, value));
                    }
                }
                None => {
                    self.inner.cache.drop(key);
                    if !self.is_ram_only(key) {
                        receivers.push(self.inner.writes.stage_remove(key));
                    }
                }
            }
        }

        self.inner.connections.refresh_session_id();
        info!("clear called, {} keys reset, {} preserved", to_reset.len(), keys_to_preserve.len());
        self.settle_and_wait(receivers).await
    }

    // -----------------------------------------------------------------
    // Synchronous apply steps
    // -----------------------------------------------------------------

    fn clear_pending_merges(&self, key: &str) {
        let pending = self.inner.merge_queue.lock().remove(key);
        if let Some(pending) = pending {
            for waiter in pending.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn apply_set(&self, key: &str, value: Value) -> Option<WriteReceiver> {
        if self.is_skippable_member(key) {
            return None;
        }
        self.clear_pending_merges(key);
        if value.is_null() {
            return self.apply_remove(key);
        }

        let cache = &self.inner.cache;
        if let Some((existing_type, new_type)) =
            check_compatibility(cache.get(key).as_ref(), &value)
        {
            warn!(
                "Warning: Trying to apply \"set\" with {} type to {} type in the key \"{}\"",
                new_type, existing_type, key
            );
            return None;
        }

        let value = remove_nested_nulls(&value);
        let has_changed = cache.has_value_changed(key, Some(&value));
        info!(
            "set called for key: {}{} hasChanged: {}",
            key,
            describe_properties(&value),
            has_changed
        );
        cache.set(key, Some(value.clone()));
        cache.add_to_accessed_keys(key);
        if !has_changed {
            return None;
        }
        self.schedule_notifications(key, Some(&value));
        if self.is_ram_only(key) {
            return None;
        }
        Some(self.inner.writes.stage_set(key, value))
    }

    fn apply_remove(&self, key: &str) -> Option<WriteReceiver> {
        let cache = &self.inner.cache;
        if cache.has_value_changed(key, None) {
            self.schedule_notifications(key, None);
        }
        cache.set(key, None);
        if self.is_ram_only(key) {
            return None;
        }
        Some(self.inner.writes.stage_remove(key))
    }

    fn enqueue_or_apply_merge(&self, key: &str, change: Value) -> Option<WriteReceiver> {
        if self.is_skippable_member(key) {
            return None;
        }
        {
            let mut queue = self.inner.merge_queue.lock();
            if let Some(pending) = queue.get_mut(key) {
                let (sender, receiver) = oneshot::channel();
                pending.changes.push(change);
                pending.waiters.push(sender);
                return Some(receiver);
            }
        }
        let existing = self.inner.cache.get(key);
        self.apply_merge(key, existing, vec![change])
    }

    fn apply_merge(
        &self,
        key: &str,
        existing: Option<Value>,
        changes: Vec<Value>,
    ) -> Option<WriteReceiver> {
        let valid: Vec<Value> = changes
            .into_iter()
            .filter(|change| match check_compatibility(existing.as_ref(), change) {
                Some((existing_type, new_type)) => {
                    warn!(
                        "Warning: Trying to apply \"merge\" with {} type to {} type in the key \"{}\"",
                        new_type, existing_type, key
                    );
                    false
                }
                None => true,
            })
            .collect();
        let marked = merge_and_mark_changes(&valid)?;

        let cache = &self.inner.cache;
        let new_value = marked.apply_to(existing.as_ref());
        let has_changed = cache.has_value_changed(key, new_value.as_ref());
        info!(
            "merge called for key: {}{} hasChanged: {}",
            key,
            describe_properties(&marked.result()),
            has_changed
        );
        cache.set(key, new_value.clone());
        cache.add_to_accessed_keys(key);
        if !has_changed {
            return None;
        }
        self.schedule_notifications(key, new_value.as_ref());
        if self.is_ram_only(key) {
            return None;
        }

        let writes = &self.inner.writes;
        Some(match new_value {
            None => writes.stage_remove(key),
            Some(value) if existing.is_none() || marked.is_replacement() => {
                writes.stage_set(key, value)
            }
            Some(_) => writes.stage_merge(key, marked),
        })
    }

    fn validate_collection(
        &self,
        method: &str,
        collection_key: &str,
        members: Map<String, Value>,
    ) -> StoreResult<Map<String, Value>> {
        if !self.inner.keys.is_collection_key(collection_key) {
            return Err(StoreError::NotACollectionKey { key: collection_key.to_owned() });
        }
        if members.is_empty() && method == "mergeCollection" {
            warn!("{}() called with invalid or empty value. Skipping this update.", method);
            return Ok(members);
        }
        let mut valid = Map::new();
        for (key, value) in members {
            if !is_collection_member_key(collection_key, &key) {
                warn!(
                    "Provided collection doesn't have all its data belonging to the same parent. CollectionKey: {}, DataKey: {}",
                    collection_key, key
                );
                continue;
            }
            if self.is_skippable_member(&key) {
                continue;
            }
            valid.insert(key, value);
        }
        Ok(valid)
    }

    fn apply_merge_collection(
        &self,
        collection_key: &str,
        members: Map<String, Value>,
    ) -> Vec<WriteReceiver> {
        let cache = &self.inner.cache;
        let mut receivers = Vec::new();
        for (key, change) in members {
            if change.is_null() {
                receivers.extend(self.apply_remove(&key));
                continue;
            }
            let existing = cache.get(&key);
            if let Some((existing_type, new_type)) =
                check_compatibility(existing.as_ref(), &change)
            {
                warn!(
                    "Warning: Trying to apply \"mergecollection\" with {} type to {} type in the key \"{}\"",
                    new_type, existing_type, key
                );
                continue;
            }
            let new_value = merge_value(existing.as_ref(), Some(&change), MergeOptions::default())
                .filter(|v| !v.is_null());
            let has_changed = cache.has_value_changed(&key, new_value.as_ref());
            cache.set(&key, new_value.clone());
            cache.add_to_accessed_keys(&key);
            if !has_changed {
                continue;
            }
            self.schedule_notifications(&key, new_value.as_ref());
            if self.is_ram_only(&key) {
                continue;
            }
            let receiver = match (existing, new_value) {
                (_, None) => self.inner.writes.stage_remove(&key),
                (Some(_), Some(_)) => {
                    self.inner.writes.stage_merge(&key, MarkedChanges::from_value(&change))
                }
                (None, Some(value)) => self.inner.writes.stage_set(&key, value),
            };
            receivers.push(receiver);
        }
        debug!(collection = collection_key, writes = receivers.len(), "mergeCollection applied");
        receivers
    }

    fn apply_set_collection(
        &self,
        collection_key: &str,
        members: Map<String, Value>,
    ) -> Vec<WriteReceiver> {
        let mut receivers = Vec::new();
        for key in self.inner.cache.collection_member_keys(collection_key) {
            if !members.contains_key(&key) {
                self.clear_pending_merges(&key);
                receivers.extend(self.apply_remove(&key));
            }
        }
        for (key, value) in members {
            receivers.extend(self.apply_set(&key, value));
        }
        receivers
    }

    // -----------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------

    /// Queue deliveries of `value` for every registration observing `key`.
    fn schedule_notifications(&self, key: &str, value: Option<&Value>) {
        let owning_collection = self.inner.keys.owning_collection(key);
        let subscribers = self.inner.connections.subscribers(key, owning_collection);
        for (registration_id, delivery) in subscribers {
            match delivery {
                Delivery::Value => {
                    let payload = Pending::Value(value.cloned());
                    self.inner.batcher.schedule(registration_id, key, payload)
                }
                Delivery::Collection(collection_key) => {
                    let payload = match self.inner.batcher.mode() {
                        DeliveryMode::Batched => Pending::Snapshot(collection_key.clone()),
                        DeliveryMode::EveryChange => {
                            Pending::Value(self.snapshot_value(&collection_key))
                        }
                    };
                    self.inner.batcher.schedule(registration_id, &collection_key, payload);
                }
            }
        }
    }

    fn snapshot_value(&self, collection_key: &str) -> Option<Value> {
        self.inner
            .cache
            .get_collection_data(collection_key)
            .map(|snapshot| Value::Object((*snapshot).clone()))
    }

    /// Deliver every queued notification.
    fn flush_notifications(&self) {
        for scheduled in self.inner.batcher.take() {
            let value = match scheduled.payload {
                Pending::Value(value) => value,
                Pending::Snapshot(collection_key) => self.snapshot_value(&collection_key),
            };
            self.inner.connections.fire(
                scheduled.registration_id,
                value.as_ref(),
                &scheduled.source_key,
            );
        }
    }

    /// End of a write burst: let concurrent writers join, notify, trim the
    /// cache back to its bound, persist.
    async fn settle(&self) {
        tokio::task::yield_now().await;
        self.flush_notifications();
        self.trim_cache();
        self.flush_writes().await;
    }

    async fn settle_and_wait(&self, receivers: Vec<WriteReceiver>) -> StoreResult<()> {
        self.settle().await;
        let mut outcome = Ok(());
        for receiver in receivers {
            // A dropped sender means the write was discarded
            if let Ok(Err(error)) = receiver.await {
                outcome = Err(error);
            }
        }
        outcome
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Flush every staged write to the backend.
    ///
    /// Sets, merges and removes each go out as one batch call. A batch is
    /// retried per the error class: corrupt data fails the batch at once,
    /// a full backend evicts one key per attempt, anything else retries as is.
    pub async fn flush_writes(&self) {
        let _guard = self.inner.writes.flush_guard().await;
        let staged = self.inner.writes.take_dirty();
        if staged.is_empty() {
            return;
        }

        let mut sets = Vec::new();
        let mut merges = Vec::new();
        let mut removes = Vec::new();
        for write in staged {
            match &write.write {
                PendingWrite::Set(_) => sets.push(write),
                PendingWrite::Merge(_) => merges.push(write),
                PendingWrite::Remove => removes.push(write),
            }
        }

        let mut flushed = 0u64;
        if !sets.is_empty() {
            let entries: Vec<(String, Value)> = sets
                .iter()
                .filter_map(|write| match &write.write {
                    PendingWrite::Set(value) => Some((write.key.clone(), value.clone())),
                    _ => None,
                })
                .collect();
            let result = self
                .persist(&sets, "multiSet", |provider| {
                    let entries = entries.clone();
                    async move { provider.multi_set(entries).await }
                })
                .await;
            flushed += resolve_all(sets, result);
        }
        if !merges.is_empty() {
            let pairs: Vec<MergePair> = merges
                .iter()
                .filter_map(|write| match &write.write {
                    PendingWrite::Merge(change) => Some(MergePair {
                        key: write.key.clone(),
                        change: change.result(),
                        replace_null_patches: change.replace_null_patches(),
                    }),
                    _ => None,
                })
                .collect();
            let result = self
                .persist(&merges, "multiMerge", |provider| {
                    let pairs = pairs.clone();
                    async move { provider.multi_merge(pairs).await }
                })
                .await;
            flushed += resolve_all(merges, result);
        }
        if !removes.is_empty() {
            let keys: Vec<String> = removes.iter().map(|write| write.key.clone()).collect();
            let result = self
                .persist(&removes, "removeItems", |provider| {
                    let keys = keys.clone();
                    async move { provider.remove_items(&keys).await }
                })
                .await;
            flushed += resolve_all(removes, result);
        }

        self.inner.writes.record_cycle(flushed);
    }

    async fn persist<F, Fut>(
        &self,
        batch: &[StagedWrite],
        operation: &str,
        write: F,
    ) -> StoreResult<()>
    where
        F: Fn(Arc<dyn StorageProvider>) -> Fut,
        Fut: Future<Output = StorageResult<()>>,
    {
        let batch_keys: HashSet<String> = batch.iter().map(|write| write.key.clone()).collect();
        let max_attempts = self.inner.config.max_write_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match write(self.provider()).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if error.is_fatal() {
                error!(
                    "Storage rejected {} of {} keys. Error: {}",
                    operation,
                    batch_keys.len(),
                    error
                );
                return Err(error.into());
            }
            if attempt >= max_attempts {
                error!(
                    "Failed to save to storage after {} attempts. Operation: {} Error: {}",
                    attempt, operation, error
                );
                return Ok(());
            }
            if error.is_quota() {
                let Some(key) = self.inner.cache.get_key_for_eviction(&batch_keys) else {
                    error!("Out of storage. But found no acceptable keys to remove.");
                    return Ok(());
                };
                info!(
                    "Out of storage. Evicting least recently accessed key ({}) and retrying.",
                    key
                );
                self.evict_key(&key).await;
            } else {
                debug!(attempt, operation, error = %error, "retrying storage write");
            }
        }
    }

    /// Remove `key` from cache and backend to free space; observers see it become absent.
    async fn evict_key(&self, key: &str) {
        self.inner.writes.discard([key]);
        let had_value = self.inner.cache.has_value_changed(key, None);
        self.inner.cache.drop(key);
        if had_value {
            self.schedule_notifications(key, None);
            self.flush_notifications();
        }
        if let Err(error) = self.provider().remove_item(key).await {
            warn!("Unable to remove evicted key {} from storage. Error: {}", key, error);
        }
    }

    // -----------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------

    /// Subscribe to a key or collection.
    ///
    /// Unless `init_with_stored_values` is off, the callback receives the
    /// current value before this returns.
    pub async fn connect(&self, options: ConnectOptions) -> ConnectionHandle {
        self.wait_until_ready().await;
        let key = options.key.clone();
        let can_evict = options.can_evict;
        let init = options.init_with_stored_values;
        let is_collection_key = self.inner.keys.is_collection_key(&key);
        let (handle, outcome) = self.inner.connections.connect(options, is_collection_key);

        let evictable = self.inner.cache.is_evictable(&key);
        if !can_evict {
            if evictable {
                self.inner.cache.add_eviction_block(&key, handle.registration_id);
            } else {
                warn!(
                    "connect() called with can_evict false for key '{}', which is not an evictable key. Ignoring.",
                    key
                );
            }
        }

        match outcome {
            ConnectOutcome::New if init => self.deliver_initial_value(handle.registration_id).await,
            ConnectOutcome::New | ConnectOutcome::Pending => {}
            ConnectOutcome::Delivered { value, key } => {
                self.inner.connections.fire_one(handle, value.as_ref(), &key);
            }
        }
        if evictable {
            self.trim_cache();
        }
        handle
    }

    async fn deliver_initial_value(&self, registration_id: u64) {
        let Some(info) = self.inner.connections.registration(registration_id) else {
            return;
        };
        let connections = &self.inner.connections;
        if info.key.is_empty() {
            connections.fire(registration_id, None, &info.key);
            return;
        }

        if !self.inner.keys.is_collection_key(&info.key) {
            let value = self.get_value(&info.key).await;
            connections.fire(registration_id, value.as_ref(), &info.key);
            return;
        }

        let members = self.known_members(&info.key).await;
        self.preload(members).await;
        if info.wait_for_collection_callback {
            let snapshot = self.snapshot_value(&info.key);
            connections.fire(registration_id, snapshot.as_ref(), &info.key);
            return;
        }

        let cache = &self.inner.cache;
        let member_values: Vec<(String, Value)> = cache
            .collection_member_keys(&info.key)
            .into_iter()
            .filter_map(|member| cache.get(&member).map(|value| (member, value)))
            .collect();
        if member_values.is_empty() {
            connections.fire(registration_id, None, &info.key);
            return;
        }
        for (member, value) in member_values {
            connections.fire(registration_id, Some(&value), &member);
        }
    }

    /// Drop one connection; the shared registration goes when its last connection does.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        if let Some(info) = self.inner.connections.disconnect(handle) {
            self.inner.cache.remove_eviction_block(&info.key, info.registration_id);
            self.inner.batcher.forget_registration(info.registration_id);
        }
    }

    /// Drop every connection. Computed keys lose their dependency
    /// subscriptions and are set up again on their next connect.
    pub fn disconnect_all(&self) {
        self.inner.computed.lock().clear();
        for info in self.inner.connections.disconnect_all() {
            self.inner.cache.remove_eviction_block(&info.key, info.registration_id);
            self.inner.batcher.forget_registration(info.registration_id);
        }
    }

    // -----------------------------------------------------------------
    // Computed keys
    // -----------------------------------------------------------------

    /// Subscribe to a computed key.
    ///
    /// The first connect subscribes to every dependency and computes the
    /// value once; later connects reuse the cached result. The dependency
    /// subscriptions stay up until `disconnect_all`.
    pub async fn connect_computed<F>(&self, computed: ComputedKey, callback: F) -> ConnectionHandle
    where
        F: Fn(Option<&Value>, &str) + Send + Sync + 'static,
    {
        self.wait_until_ready().await;
        self.setup_computed(computed.clone()).await;
        self.connect(ConnectOptions::new(computed.cache_key(), callback)).await
    }

    /// True if `key` is the cache key of a computed key in use.
    pub fn is_computed(&self, key: &str) -> bool {
        self.inner.computed.lock().contains_key(key)
    }

    /// Concurrent setups of one computed key share a single run.
    fn setup_computed(&self, computed: ComputedKey) -> BoxFuture<'static, ()> {
        let store = self.clone();
        let task_id = computed.setup_task_id();
        self.inner
            .cache
            .capture_task(&task_id, async move { store.subscribe_dependencies(computed).await })
            .boxed()
    }

    async fn subscribe_dependencies(&self, computed: ComputedKey) {
        let cache_key = computed.cache_key().to_owned();
        {
            let mut states = self.inner.computed.lock();
            if states.contains_key(&cache_key) {
                return;
            }
            let state = ComputedState { key: computed.clone(), active: false };
            states.insert(cache_key.clone(), state);
        }

        for dependency in computed.dependencies() {
            let weak = Arc::downgrade(&self.inner);
            let target = cache_key.clone();
            let on_change = move |_: Option<&Value>, _: &str| {
                if let Some(inner) = weak.upgrade() {
                    Store { inner }.recompute(&target);
                }
            };
            match dependency {
                Dependency::Key(key) => {
                    let options = ConnectOptions::new(key.clone(), on_change)
                        .wait_for_collection_callback(true);
                    self.connect(options).await;
                }
                Dependency::Computed(inner) => {
                    self.connect_computed(inner.clone(), on_change).await;
                }
            }
        }

        if let Some(state) = self.inner.computed.lock().get_mut(&cache_key) {
            state.active = true;
        }
        debug!(
            key = %cache_key,
            dependencies = computed.dependencies().len(),
            "computed key set up"
        );
        self.recompute(&cache_key);
    }

    /// Recompute `cache_key` from the cached dependency values and deliver
    /// the result if it changed. Skipped while any dependency has no value.
    fn recompute(&self, cache_key: &str) {
        let computed = match self.inner.computed.lock().get(cache_key) {
            Some(state) if state.active => state.key.clone(),
            _ => return,
        };

        let mut values = Vec::with_capacity(computed.dependencies().len());
        for dependency in computed.dependencies() {
            let value = match dependency {
                Dependency::Key(key) if self.inner.keys.is_collection_key(key) => {
                    Some(self.snapshot_value(key).unwrap_or_else(|| Value::Object(Map::new())))
                }
                Dependency::Key(key) => self.inner.cache.get(key),
                Dependency::Computed(inner) => self.inner.cache.get(inner.cache_key()),
            };
            match value {
                Some(value) => values.push(value),
                None => return,
            }
        }

        let value = Some(computed.compute(&values)).filter(|value| !value.is_null());
        let cache = &self.inner.cache;
        if !cache.has_value_changed(cache_key, value.as_ref()) {
            return;
        }
        cache.set(cache_key, value.clone());
        for (registration_id, _) in self.inner.connections.subscribers(cache_key, None) {
            self.inner.connections.fire(registration_id, value.as_ref(), cache_key);
        }
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.inner.connections.registration_count()
    }

    // -----------------------------------------------------------------
    // Cross-instance sync
    // -----------------------------------------------------------------

    fn subscribe_to_instance_changes(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.provider().keep_instances_sync(Arc::new(move |key, value| {
            if let Some(inner) = weak.upgrade() {
                Store { inner }.apply_external_change(key, value);
            }
        }));
    }

    /// Another instance wrote `key`: update the cache and notify, without writing back.
    fn apply_external_change(&self, key: &str, value: Option<Value>) {
        if self.is_ram_only(key) {
            return;
        }
        let value = value.filter(|value| !value.is_null());
        let cache = &self.inner.cache;
        if !cache.has_value_changed(key, value.as_ref()) {
            return;
        }
        cache.set(key, value.clone());
        self.schedule_notifications(key, value.as_ref());
        self.flush_notifications();
    }

    // -----------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------

    /// Keys with staged writes not yet handed to the backend.
    pub fn pending_write_count(&self) -> usize {
        self.inner.writes.dirty_count()
    }

    /// Writes persisted since the store started.
    pub fn total_flushed(&self) -> u64 {
        self.inner.writes.total_flushed()
    }

    /// Flush cycles completed.
    pub fn flush_cycles(&self) -> u64 {
        self.inner.writes.total_cycles()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("provider", &self.provider().name())
            .field("ready", &self.is_ready())
            .field("cache", &self.inner.cache)
            .field("writes", &self.inner.writes)
            .finish()
    }
}

fn resolve_all(writes: Vec<StagedWrite>, result: StoreResult<()>) -> u64 {
    let count = if result.is_ok() { writes.len() as u64 } else { 0 };
    for write in writes {
        write.resolve(result.clone());
    }
    count
}

/// ` properties: a,b` for objects, nothing otherwise. Values are never logged.
fn describe_properties(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let names: Vec<&str> = map.keys().map(String::as_str).collect();
            format!(" properties: {}", names.join(","))
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store(config: StoreConfig) -> (Store, Arc<MemoryProvider>) {
        let provider = Arc::new(MemoryProvider::new());
        let store = Store::new(config, provider.clone()).unwrap();
        store.init().await.unwrap();
        (store, provider)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (store, provider) = test_store(StoreConfig::default()).await;
        store.set("k", Some(json!({"a": 1, "b": null}))).await.unwrap();
        assert_eq!(store.get("k").await, Some(json!({"a": 1})));
        assert_eq!(provider.peek("k"), Some(json!({"a": 1})));
        assert_eq!(store.pending_write_count(), 0);
        assert_eq!(store.total_flushed(), 1);
    }

    #[tokio::test]
    async fn test_undefined_is_noop() {
        let (store, provider) = test_store(StoreConfig::default()).await;
        store.set("k", Some(json!(1))).await.unwrap();
        store.set("k", None).await.unwrap();
        store.merge("k", None).await.unwrap();
        assert_eq!(store.get("k").await, Some(json!(1)));
        assert_eq!(provider.peek("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_merge_resurrects_after_delete() {
        let (store, provider) = test_store(StoreConfig::default()).await;
        store.set("k", Some(json!(1))).await.unwrap();
        store.merge("k", Some(Value::Null)).await.unwrap();
        assert_eq!(store.cache().get("k"), None);
        assert_eq!(provider.peek("k"), None);
        store.merge("k", Some(json!(2))).await.unwrap();
        assert_eq!(store.cache().get("k"), Some(json!(2)));
        assert_eq!(provider.peek("k"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_storage() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set_item("stored", json!({"x": 1})).await.unwrap();
        let store = Store::new(StoreConfig::default(), provider.clone()).unwrap();
        store.init().await.unwrap();

        assert!(!store.cache().has_cache_for_key("stored"));
        assert_eq!(store.get("stored").await, Some(json!({"x": 1})));
        assert!(store.cache().has_cache_for_key("stored"));
        assert!(store.get_all_keys().await.contains("stored"));
        assert_eq!(store.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_merge_onto_stored_value_uses_backend_merge() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set_item("k", json!({"a": 1, "d": {"x": 1}})).await.unwrap();
        let store = Store::new(StoreConfig::default(), provider.clone()).unwrap();
        store.init().await.unwrap();

        let (first, second, third) = tokio::join!(
            store.merge("k", Some(json!({"d": {"h": "h"}}))),
            store.merge("k", Some(json!({"d": null, "h": "h"}))),
            store.merge("k", Some(json!({"d": {"i": "i"}}))),
        );
        first.unwrap();
        second.unwrap();
        third.unwrap();

        let expected = json!({"a": 1, "d": {"i": "i"}, "h": "h"});
        assert_eq!(store.cache().get("k"), Some(expected.clone()));
        assert_eq!(provider.peek("k"), Some(expected));
    }

    #[tokio::test]
    async fn test_incompatible_set_is_skipped() {
        let (store, _) = test_store(StoreConfig::default()).await;
        store.set("k", Some(json!([1, 2]))).await.unwrap();
        store.set("k", Some(json!({"a": 1}))).await.unwrap();
        store.merge("k", Some(json!({"a": 1}))).await.unwrap();
        assert_eq!(store.get("k").await, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_default_key_states() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set_item("session", json!({"token": "t"})).await.unwrap();
        let config = StoreConfig::default()
            .with_default("session", json!({"loading": false}))
            .with_default("n", json!(0));
        let store = Store::new(config, provider).unwrap();
        store.init().await.unwrap();

        assert_eq!(store.get("session").await, Some(json!({"token": "t", "loading": false})));
        assert_eq!(store.get("n").await, Some(json!(0)));
    }

    #[tokio::test]
    async fn test_collection_key_required() {
        let (store, _) = test_store(StoreConfig::default()).await;
        let members = json!({"x_1": 1}).as_object().cloned().unwrap();
        let err = store.merge_collection("x_", members).await.unwrap_err();
        assert_eq!(err, StoreError::NotACollectionKey { key: "x_".into() });
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StoreConfig::default().with_max_cached_keys(0);
        let err = Store::new(config, Arc::new(MemoryProvider::new())).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_describe_properties() {
        assert_eq!(describe_properties(&json!({"a": 1, "b": 2})), " properties: a,b");
        assert_eq!(describe_properties(&json!(1)), "");
    }
}
