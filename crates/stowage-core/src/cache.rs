//! Cache store
//!
//! The in-memory source of truth for readers. Holds key values (or a
//! known-absent marker), the set of known keys, access recency for LRU
//! eviction, memoized collection snapshots and the in-flight read registry.
//!
//! All operations are synchronous and total except [`Cache::merge`], which
//! rejects input that is not a key/value object.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};
use crate::keys::{KeyMatcher, KeyRegistry};
use crate::merge::{merge_value, MergeOptions};
use crate::tasks::TaskRegistry;

/// Aggregate of all live members of a collection, keyed by member key.
pub type CollectionSnapshot = Arc<Map<String, Value>>;

/// Result of looking a key up in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Never read or written
    Unknown,
    /// Read or written, and currently without a value
    Absent,
    /// Cached value
    Value(Value),
}

struct CacheState {
    /// Every key known to exist, from storage or from writes
    storage_keys: HashSet<String>,
    /// `Some` is a cached value, `None` a known-absent key
    storage_map: HashMap<String, Option<Value>>,
    /// Evictable keys, least recently accessed first
    recent_keys: IndexSet<String>,
    /// Keys (or collection prefixes) that may be evicted
    eviction_allow_list: KeyMatcher,
    /// Keys pinned by non-evictable connections, with the pinning connection IDs
    eviction_block_list: HashMap<String, HashSet<u64>>,
    /// Upper bound on cached entries before LRU trimming kicks in
    max_cached_keys: usize,
    registry: KeyRegistry,
    /// Collection key -> member keys that currently hold a value
    collection_members: HashMap<String, BTreeSet<String>>,
    collection_snapshots: HashMap<String, CollectionSnapshot>,
    dirty_collections: HashSet<String>,
    /// `set_all_keys` has run at least once
    keys_loaded: bool,
}

impl CacheState {
    fn track_member(&mut self, key: &str, has_value: bool) {
        let Some(collection) = self.registry.owning_collection(key).map(str::to_owned) else {
            return;
        };
        let members = self.collection_members.entry(collection.clone()).or_default();
        if has_value {
            members.insert(key.to_owned());
        } else {
            members.remove(key);
        }
        self.dirty_collections.insert(collection);
    }

    fn rebuild_collection_index(&mut self) {
        self.collection_members.clear();
        let keys: Vec<(String, bool)> =
            self.storage_map.iter().map(|(key, value)| (key.clone(), value.is_some())).collect();
        for (key, has_value) in keys {
            if has_value {
                self.track_member(&key, true);
            }
        }
        for collection in self.registry.collection_keys() {
            self.dirty_collections.insert(collection.to_owned());
        }
    }

    fn is_blocked(&self, key: &str) -> bool {
        self.eviction_block_list.get(key).map_or(false, |ids| !ids.is_empty())
    }

    fn evict(&mut self, key: &str) {
        self.storage_map.remove(key);
        self.recent_keys.shift_remove(key);
        self.track_member(key, false);
    }
}

/// In-memory cache shared by the connection manager and the persistence coordinator.
pub struct Cache {
    state: Mutex<CacheState>,
    tasks: TaskRegistry,
}

impl Cache {
    /// Create an empty cache holding at most `max_cached_keys` entries after trimming.
    pub fn new(registry: KeyRegistry, max_cached_keys: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                storage_keys: HashSet::new(),
                storage_map: HashMap::new(),
                recent_keys: IndexSet::new(),
                eviction_allow_list: KeyMatcher::default(),
                eviction_block_list: HashMap::new(),
                max_cached_keys,
                registry,
                collection_members: HashMap::new(),
                collection_snapshots: HashMap::new(),
                dirty_collections: HashSet::new(),
                keys_loaded: false,
            }),
            tasks: TaskRegistry::new(),
        }
    }

    // -----------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------

    /// Cached value for `key`. Never reads storage.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().storage_map.get(key).cloned().flatten()
    }

    /// Distinguishes "never read" from "known absent".
    pub fn lookup(&self, key: &str) -> CacheLookup {
        match self.state.lock().storage_map.get(key) {
            None => CacheLookup::Unknown,
            Some(None) => CacheLookup::Absent,
            Some(Some(value)) => CacheLookup::Value(value.clone()),
        }
    }

    /// True only if a concrete value is cached.
    pub fn has_cache_for_key(&self, key: &str) -> bool {
        matches!(self.state.lock().storage_map.get(key), Some(Some(_)))
    }

    /// True if the key has been read or written and has no value.
    pub fn is_known_absent(&self, key: &str) -> bool {
        matches!(self.state.lock().storage_map.get(key), Some(None))
    }

    /// True if `value` differs from what is cached for `key`.
    pub fn has_value_changed(&self, key: &str, value: Option<&Value>) -> bool {
        self.state.lock().storage_map.get(key).and_then(Option::as_ref) != value
    }

    /// Store `value` for `key`; `None` (or `null`) leaves the key known but absent.
    pub fn set(&self, key: &str, value: Option<Value>) {
        let value = value.filter(|value| !value.is_null());
        let mut state = self.state.lock();
        state.storage_keys.insert(key.to_owned());
        let has_value = value.is_some();
        state.storage_map.insert(key.to_owned(), value);
        state.track_member(key, has_value);
    }

    /// Merge every `key: partial` pair of `data` into the cached values.
    ///
    /// Partials resolving to nothing (`null`) leave their key absent.
    pub fn merge(&self, data: &Value) -> StoreResult<()> {
        let Value::Object(entries) = data else {
            return Err(StoreError::InvalidMergeInput);
        };
        let mut state = self.state.lock();
        for (key, partial) in entries {
            let existing = state.storage_map.get(key).and_then(Option::as_ref);
            let merged = merge_value(existing, Some(partial), MergeOptions::default())
                .filter(|v| !v.is_null());
            state.storage_keys.insert(key.clone());
            let has_value = merged.is_some();
            state.storage_map.insert(key.clone(), merged);
            state.track_member(key, has_value);
        }
        Ok(())
    }

    /// Forget `key` entirely: value, known-key membership and recency.
    pub fn drop(&self, key: &str) {
        let mut state = self.state.lock();
        state.storage_keys.remove(key);
        state.evict(key);
    }

    // -----------------------------------------------------------------
    // Known keys
    // -----------------------------------------------------------------

    /// Register `key` as existing without caching a value.
    pub fn add_key(&self, key: &str) {
        self.state.lock().storage_keys.insert(key.to_owned());
    }

    /// Every known key, sorted.
    pub fn get_all_keys(&self) -> BTreeSet<String> {
        self.state.lock().storage_keys.iter().cloned().collect()
    }

    /// Replace the known-key set with what storage reported.
    pub fn set_all_keys<I: IntoIterator<Item = String>>(&self, keys: I) {
        let mut state = self.state.lock();
        state.storage_keys = keys.into_iter().collect();
        state.keys_loaded = true;
    }

    /// True once the key list has been loaded from storage.
    pub fn keys_loaded(&self) -> bool {
        self.state.lock().keys_loaded
    }

    // -----------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------

    /// Declare the collection keys. Every collection snapshot is invalidated.
    pub fn set_collection_keys(&self, registry: KeyRegistry) {
        let mut state = self.state.lock();
        state.registry = registry;
        state.collection_snapshots.clear();
        state.rebuild_collection_index();
    }

    /// Member keys of `collection_key` that currently hold a cached value.
    pub fn collection_member_keys(&self, collection_key: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .collection_members
            .get(collection_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Memoized snapshot of `collection_key`.
    ///
    /// Recomputed only after a member changed; if the recomputation equals the
    /// previous snapshot, the previous `Arc` is returned. `None` when the
    /// collection has no live members.
    pub fn get_collection_data(&self, collection_key: &str) -> Option<CollectionSnapshot> {
        let mut state = self.state.lock();
        if !state.dirty_collections.contains(collection_key) {
            if let Some(snapshot) = state.collection_snapshots.get(collection_key) {
                return Some(Arc::clone(snapshot));
            }
        }
        state.dirty_collections.remove(collection_key);

        let mut data = Map::new();
        if let Some(members) = state.collection_members.get(collection_key) {
            for member in members {
                if let Some(Some(value)) = state.storage_map.get(member) {
                    data.insert(member.clone(), value.clone());
                }
            }
        }

        if data.is_empty() {
            state.collection_snapshots.remove(collection_key);
            return None;
        }

        if let Some(previous) = state.collection_snapshots.get(collection_key) {
            if **previous == data {
                return Some(Arc::clone(previous));
            }
        }
        let snapshot = Arc::new(data);
        state.collection_snapshots.insert(collection_key.to_owned(), Arc::clone(&snapshot));
        Some(snapshot)
    }

    // -----------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------

    /// Keys (or collection prefixes) that may be evicted.
    pub fn set_eviction_allow_list(&self, allow_list: KeyMatcher) {
        self.state.lock().eviction_allow_list = allow_list;
    }

    pub fn is_evictable(&self, key: &str) -> bool {
        self.state.lock().eviction_allow_list.matches(key)
    }

    /// Mark `key` as most recently used. Ignored for non-evictable keys.
    pub fn add_to_accessed_keys(&self, key: &str) {
        let mut state = self.state.lock();
        if !state.eviction_allow_list.matches(key) {
            return;
        }
        state.recent_keys.shift_remove(key);
        state.recent_keys.insert(key.to_owned());
    }

    /// Evictable keys in eviction order (least recently accessed first).
    pub fn accessed_keys(&self) -> Vec<String> {
        self.state.lock().recent_keys.iter().cloned().collect()
    }

    /// Pin `key` on behalf of connection `connection_id`.
    pub fn add_eviction_block(&self, key: &str, connection_id: u64) {
        self.state
            .lock()
            .eviction_block_list
            .entry(key.to_owned())
            .or_default()
            .insert(connection_id);
    }

    /// Release the pin held by `connection_id`.
    pub fn remove_eviction_block(&self, key: &str, connection_id: u64) {
        let mut state = self.state.lock();
        if let Some(ids) = state.eviction_block_list.get_mut(key) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                state.eviction_block_list.remove(key);
            }
        }
    }

    pub fn is_eviction_blocked(&self, key: &str) -> bool {
        self.state.lock().is_blocked(key)
    }

    /// Evict least recently used unpinned candidates until the cache is
    /// within `max_cached_keys`. Returns the evicted keys, oldest first.
    ///
    /// Evicted keys stay known; their next read goes back to storage.
    pub fn remove_least_recently_used_keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        if state.storage_map.len() <= state.max_cached_keys {
            return evicted;
        }
        let candidates: Vec<String> =
            state.recent_keys.iter().filter(|key| !state.is_blocked(key)).cloned().collect();
        for key in candidates {
            if state.storage_map.len() <= state.max_cached_keys {
                break;
            }
            state.evict(&key);
            evicted.push(key);
        }
        evicted
    }

    /// Least recently accessed evictable key that is neither pinned nor in `exclude`.
    pub fn get_key_for_eviction(&self, exclude: &HashSet<String>) -> Option<String> {
        let state = self.state.lock();
        state
            .recent_keys
            .iter()
            .find(|key| !state.is_blocked(key) && !exclude.contains(*key))
            .cloned()
    }

    // -----------------------------------------------------------------
    // In-flight tasks
    // -----------------------------------------------------------------

    pub fn capture_task<T, F>(&self, task_id: &str, future: F) -> Shared<BoxFuture<'static, T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks.capture_task(task_id, future)
    }

    pub fn get_task_promise<T>(&self, task_id: &str) -> Option<Shared<BoxFuture<'static, T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.tasks.get_task(task_id)
    }

    pub fn has_pending_task(&self, task_id: &str) -> bool {
        self.tasks.has_pending_task(task_id)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cache")
            .field("known_keys", &state.storage_keys.len())
            .field("cached", &state.storage_map.len())
            .field("max_cached_keys", &state.max_cached_keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_cache(max_cached_keys: usize) -> Cache {
        Cache::new(KeyRegistry::new(["c_", "report_"]), max_cached_keys)
    }

    #[test]
    fn test_set_and_get() {
        let cache = test_cache(10);
        assert_eq!(cache.lookup("k"), CacheLookup::Unknown);
        cache.set("k", Some(json!(1)));
        assert_eq!(cache.get("k"), Some(json!(1)));
        assert!(cache.has_cache_for_key("k"));

        cache.set("k", Some(Value::Null));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_known_absent("k"));
        assert!(!cache.has_cache_for_key("k"));
        assert!(cache.get_all_keys().contains("k"));
    }

    #[test]
    fn test_add_key_is_known_but_uncached() {
        let cache = test_cache(10);
        cache.add_key("k");
        assert!(cache.get_all_keys().contains("k"));
        assert!(!cache.has_cache_for_key("k"));
        assert_eq!(cache.lookup("k"), CacheLookup::Unknown);
    }

    #[test]
    fn test_merge() {
        let cache = test_cache(10);
        cache.set("a", Some(json!({"x": 1, "y": 2})));
        cache.set("b", Some(json!(true)));
        cache.merge(&json!({"a": {"y": null, "z": 3}, "b": null, "c": [1]})).unwrap();

        assert_eq!(cache.get("a"), Some(json!({"x": 1, "z": 3})));
        assert!(cache.is_known_absent("b"));
        assert_eq!(cache.get("c"), Some(json!([1])));
    }

    #[test]
    fn test_merge_rejects_non_object() {
        let cache = test_cache(10);
        assert_eq!(cache.merge(&json!([1, 2])), Err(StoreError::InvalidMergeInput));
        assert_eq!(cache.merge(&json!("x")), Err(StoreError::InvalidMergeInput));
    }

    #[test]
    fn test_drop_forgets_key() {
        let cache = test_cache(10);
        cache.set("k", Some(json!(1)));
        cache.drop("k");
        assert_eq!(cache.lookup("k"), CacheLookup::Unknown);
        assert!(!cache.get_all_keys().contains("k"));
    }

    #[test]
    fn test_has_value_changed() {
        let cache = test_cache(10);
        assert!(cache.has_value_changed("k", Some(&json!(1))));
        assert!(!cache.has_value_changed("k", None));
        cache.set("k", Some(json!({"a": 1})));
        assert!(!cache.has_value_changed("k", Some(&json!({"a": 1}))));
        assert!(cache.has_value_changed("k", None));
    }

    #[test]
    fn test_collection_snapshot_reference_stability() {
        let cache = test_cache(10);
        assert!(cache.get_collection_data("c_").is_none());

        cache.set("c_1", Some(json!({"x": 1})));
        cache.set("c_2", Some(json!({"x": 2})));
        cache.set("other", Some(json!(1)));

        let first = cache.get_collection_data("c_").unwrap();
        let second = cache.get_collection_data("c_").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, json!({"c_1": {"x": 1}, "c_2": {"x": 2}}).as_object().cloned().unwrap());

        // Same content written again keeps the reference
        cache.set("c_1", Some(json!({"x": 1})));
        assert!(Arc::ptr_eq(&first, &cache.get_collection_data("c_").unwrap()));

        cache.merge(&json!({"c_2": {"y": 3}})).unwrap();
        let third = cache.get_collection_data("c_").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.get("c_2"), Some(&json!({"x": 2, "y": 3})));

        cache.drop("c_1");
        let fourth = cache.get_collection_data("c_").unwrap();
        assert!(!Arc::ptr_eq(&third, &fourth));
        assert_eq!(fourth.len(), 1);

        cache.set("c_2", None);
        assert!(cache.get_collection_data("c_").is_none());
    }

    #[test]
    fn test_set_collection_keys_reindexes() {
        let cache = Cache::new(KeyRegistry::default(), 10);
        cache.set("new_1", Some(json!(1)));
        assert!(cache.get_collection_data("new_").is_none());

        cache.set_collection_keys(KeyRegistry::new(["new_"]));
        assert_eq!(cache.get_collection_data("new_").unwrap().get("new_1"), Some(&json!(1)));
        assert_eq!(cache.collection_member_keys("new_"), vec!["new_1".to_string()]);
    }

    #[test]
    fn test_lru_eviction_order() {
        let registry = KeyRegistry::new(["c_"]);
        let cache = Cache::new(registry.clone(), 2);
        cache.set_eviction_allow_list(KeyMatcher::new(&["c_"], &registry));

        for key in ["c_1", "c_2", "c_3", "c_4"] {
            cache.set(key, Some(json!(key)));
            cache.add_to_accessed_keys(key);
        }
        cache.set("pinned_elsewhere", Some(json!(0)));
        // Touching c_1 makes it the most recent
        cache.add_to_accessed_keys("c_1");
        cache.add_to_accessed_keys("not_evictable");
        assert_eq!(cache.accessed_keys(), vec!["c_2", "c_3", "c_4", "c_1"]);

        let evicted = cache.remove_least_recently_used_keys();
        assert_eq!(evicted, vec!["c_2", "c_3", "c_4"]);
        assert!(cache.has_cache_for_key("c_1"));
        assert!(cache.has_cache_for_key("pinned_elsewhere"));
        // Evicted keys stay known
        assert!(cache.get_all_keys().contains("c_2"));
        assert_eq!(cache.lookup("c_2"), CacheLookup::Unknown);
    }

    #[test]
    fn test_eviction_respects_blocks() {
        let registry = KeyRegistry::new(["c_"]);
        let cache = Cache::new(registry.clone(), 1);
        cache.set_eviction_allow_list(KeyMatcher::new(&["c_"], &registry));
        for key in ["c_1", "c_2", "c_3"] {
            cache.set(key, Some(json!(1)));
            cache.add_to_accessed_keys(key);
        }
        cache.add_eviction_block("c_1", 7);
        assert!(cache.is_eviction_blocked("c_1"));

        let evicted = cache.remove_least_recently_used_keys();
        assert_eq!(evicted, vec!["c_2", "c_3"]);
        assert!(cache.has_cache_for_key("c_1"));

        let mut exclude = HashSet::new();
        assert_eq!(cache.get_key_for_eviction(&exclude), None);
        cache.remove_eviction_block("c_1", 7);
        assert_eq!(cache.get_key_for_eviction(&exclude), Some("c_1".to_string()));
        exclude.insert("c_1".to_string());
        assert_eq!(cache.get_key_for_eviction(&exclude), None);
    }

    #[test]
    fn test_eviction_invalidates_snapshot() {
        let registry = KeyRegistry::new(["c_"]);
        let cache = Cache::new(registry.clone(), 1);
        cache.set_eviction_allow_list(KeyMatcher::new(&["c_"], &registry));
        cache.set("c_1", Some(json!(1)));
        cache.add_to_accessed_keys("c_1");
        cache.set("c_2", Some(json!(2)));
        cache.add_to_accessed_keys("c_2");

        let before = cache.get_collection_data("c_").unwrap();
        assert_eq!(before.len(), 2);
        cache.remove_least_recently_used_keys();
        let after = cache.get_collection_data("c_").unwrap();
        assert_eq!(after.len(), 1);
        assert!(after.contains_key("c_2"));
    }

    #[tokio::test]
    async fn test_capture_task_passthrough() {
        let cache = test_cache(10);
        let task = cache.capture_task("get:k", async { Some(json!(1)) });
        assert!(cache.has_pending_task("get:k"));
        assert!(cache.get_task_promise::<Option<Value>>("get:k").is_some());
        assert_eq!(task.await, Some(json!(1)));
        assert!(!cache.has_pending_task("get:k"));
    }
}
