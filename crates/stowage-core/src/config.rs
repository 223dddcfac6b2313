//! Configuration for a Stowage store
//!
//! Presets for different client classes and a builder for custom
//! configurations. The key registry, defaults and RAM-only declarations are
//! static for the lifetime of a store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keys::COLLECTION_DELIMITER;

/// How change notifications reach connection callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Changes made in one burst are coalesced; each callback sees the last value
    #[default]
    Batched,
    /// Every change is delivered, in order
    EveryChange,
}

/// Store configuration with client-class presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Registered collection keys (each ends in `_`)
    pub collection_keys: Vec<String>,
    /// Default value per key, applied at init and restored by `clear`
    pub default_key_states: Map<String, Value>,
    /// Keys or collection keys that never reach the storage backend
    pub ram_only_keys: Vec<String>,
    /// Keys or collection keys that may be evicted from cache and storage
    pub evictable_keys: Vec<String>,
    /// Cache entries kept before LRU trimming of evictable keys
    pub max_cached_keys: usize,
    /// Member IDs dropped from every collection write
    pub skippable_collection_member_ids: Vec<String>,
    /// Attempts per storage write before giving up
    pub max_write_retries: u32,
    /// Notification delivery mode
    pub delivery: DeliveryMode,
    /// Apply writes made by other store instances over the same backend
    pub keep_instances_sync: bool,
}

impl StoreConfig {
    /// Desktop-class client: large cache
    pub fn desktop() -> Self {
        Self {
            collection_keys: Vec::new(),
            default_key_states: Map::new(),
            ram_only_keys: Vec::new(),
            evictable_keys: Vec::new(),
            max_cached_keys: 1000,
            skippable_collection_member_ids: Vec::new(),
            max_write_retries: 5,
            delivery: DeliveryMode::Batched,
            keep_instances_sync: true,
        }
    }

    /// Mobile-class client
    pub fn mobile() -> Self {
        Self { max_cached_keys: 500, keep_instances_sync: false, ..Self::desktop() }
    }

    /// Memory-constrained client: small cache, fewer retries
    pub fn constrained() -> Self {
        Self {
            max_cached_keys: 100,
            max_write_retries: 3,
            keep_instances_sync: false,
            ..Self::desktop()
        }
    }

    pub fn with_collection_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collection_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default value for one key.
    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.default_key_states.insert(key.into(), value);
        self
    }

    pub fn with_ram_only_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ram_only_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_evictable_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evictable_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_cached_keys(mut self, max_cached_keys: usize) -> Self {
        self.max_cached_keys = max_cached_keys;
        self
    }

    pub fn with_skippable_member_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skippable_collection_member_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_instance_sync(mut self, enabled: bool) -> Self {
        self.keep_instances_sync = enabled;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        for key in &self.collection_keys {
            if key.len() <= 1 || !key.ends_with(COLLECTION_DELIMITER) {
                return Err(format!(
                    "collection key '{}' must be non-empty and end in '{}'",
                    key, COLLECTION_DELIMITER
                ));
            }
        }
        if self.max_cached_keys == 0 {
            return Err("max_cached_keys must be > 0".into());
        }
        if self.max_write_retries == 0 || self.max_write_retries > 100 {
            return Err("max_write_retries must be in [1, 100]".into());
        }
        if self.skippable_collection_member_ids.iter().any(String::is_empty) {
            return Err("skippable_collection_member_ids must not contain empty IDs".into());
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::desktop()
    }
}
