//! In-flight task sharing
//!
//! Concurrent reads of the same key share one storage read. A task is
//! registered under an ID (`get:<key>`, `getAllKeys`) as a shared future;
//! callers that arrive while it is pending await the same future. The entry
//! disappears as soon as the future settles.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use hashbrown::HashMap;
use parking_lot::Mutex;

type SharedTask<T> = Shared<BoxFuture<'static, T>>;

struct Entry {
    generation: u64,
    task: Box<dyn Any + Send + Sync>,
}

/// Registry of pending tasks keyed by task ID.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task ID for a single-key read.
    pub fn get_task_id(key: &str) -> String {
        format!("get:{}", key)
    }

    /// Task ID for the key listing.
    pub const GET_ALL_KEYS: &'static str = "getAllKeys";

    /// True while a task with this ID has not settled.
    pub fn has_pending_task(&self, id: &str) -> bool {
        self.tasks.lock().contains_key(id)
    }

    /// The pending task with this ID, if it produces a `T`.
    pub fn get_task<T>(&self, id: &str) -> Option<SharedTask<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.tasks
            .lock()
            .get(id)
            .and_then(|entry| entry.task.downcast_ref::<SharedTask<T>>())
            .cloned()
    }

    /// Register `future` under `id` and return the shared handle.
    ///
    /// If a task with that ID is already pending it is returned instead and
    /// `future` is dropped unpolled.
    pub fn capture_task<T, F>(&self, id: &str, future: F) -> SharedTask<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        let existing = tasks.get(id).and_then(|entry| entry.task.downcast_ref::<SharedTask<T>>());
        if let Some(existing) = existing {
            return existing.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.tasks);
        let task_id = id.to_owned();
        let shared = async move {
            let output = future.await;
            let mut tasks = registry.lock();
            // Only remove our own entry, not a later task reusing the ID
            if tasks.get(&task_id).map_or(false, |entry| entry.generation == generation) {
                tasks.remove(&task_id);
            }
            output
        }
        .boxed()
        .shared();

        tasks.insert(id.to_owned(), Entry { generation, task: Box::new(shared.clone()) });
        shared
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").field("pending", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_captures_share_one_future() {
        let registry = TaskRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let counter = Arc::clone(&runs);
        let first = registry.capture_task("get:a", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = rx.await;
            7u32
        });
        let counter = Arc::clone(&runs);
        let second = registry.capture_task("get:a", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            8u32
        });

        assert!(registry.has_pending_task("get:a"));
        assert!(registry.get_task::<u32>("get:a").is_some());
        // Wrong output type is not a match
        assert!(registry.get_task::<String>("get:a").is_none());

        tx.send(()).unwrap();
        let (a, b) = tokio::join!(first, second);
        assert_eq!((a, b), (7, 7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!registry.has_pending_task("get:a"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_settled_task_is_replaced() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.capture_task(TaskRegistry::GET_ALL_KEYS, async { 1u8 }).await, 1);
        assert_eq!(registry.capture_task(TaskRegistry::GET_ALL_KEYS, async { 2u8 }).await, 2);
        assert_eq!(TaskRegistry::get_task_id("k"), "get:k");
    }
}
