//! Stowage Core: client-side persisted key-value store
//!
//! Application state lives in a RAM cache that readers consult first, and
//! is persisted to a pluggable asynchronous backend. Observers subscribe to
//! keys or whole collections and are told when values change.
//!
//! # Architecture
//!
//! - **Merge engine** (`merge`): deep-merge of JSON values where `null`
//!   deletes and arrays replace, plus batch squashing for backend merges
//! - **Cache** (`cache`): values, known keys, LRU eviction, memoized
//!   collection snapshots, shared in-flight reads
//! - **Connections** (`connection`, `batch`): deduplicated subscriptions and
//!   coalesced notification delivery
//! - **Computed keys** (`computed`): values derived from other keys,
//!   recomputed when a dependency changes
//! - **Store** (`store`, `update`, `write_buffer`): the write pipeline,
//!   staged write coalescing, retry and eviction on backend failure
//!
//! # Backends
//!
//! Anything implementing [`StorageProvider`] can back a store.
//! [`MemoryProvider`] is included; disk storage lives in `stowage-disk`.

pub mod batch;
pub mod cache;
pub mod computed;
pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod memory;
pub mod merge;
pub mod storage;
pub mod store;
pub mod tasks;
pub mod update;
pub mod write_buffer;

// Re-export key types for convenience
pub use cache::{Cache, CacheLookup, CollectionSnapshot};
pub use computed::{ComputeFn, ComputedKey, Dependency};
pub use config::{DeliveryMode, StoreConfig};
pub use connection::{Callback, ConnectOptions, ConnectionHandle, Selector};
pub use error::{StorageError, StorageResult, StoreError, StoreResult};
pub use keys::{KeyRegistry, COLLECTION_DELIMITER};
pub use memory::MemoryProvider;
pub use merge::{
    apply_patch, merge_and_mark_changes, merge_value, MarkedChanges, MergeOptions, ReplaceNullPatch,
};
pub use storage::{DatabaseSize, MergePair, StorageChangeCallback, StorageProvider};
pub use store::Store;
pub use update::Update;
