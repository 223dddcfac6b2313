//! Computed keys
//!
//! A computed key derives its value from other keys. The store subscribes to
//! every dependency once, recomputes whenever one of them changes, and keeps
//! the result in the cache under the computed key's own cache key. Computed
//! values are never persisted.
//!
//! A dependency is a plain key, a collection key (its value is the object of
//! all cached members), or another computed key.

use std::sync::Arc;

use serde_json::Value;

/// Derives a value from the dependency values, in dependency order.
pub type ComputeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// One input of a computed key.
#[derive(Clone, Debug)]
pub enum Dependency {
    /// A plain key or a collection key
    Key(String),
    /// The value of another computed key
    Computed(ComputedKey),
}

impl From<&str> for Dependency {
    fn from(key: &str) -> Self {
        Dependency::Key(key.to_owned())
    }
}

impl From<String> for Dependency {
    fn from(key: String) -> Self {
        Dependency::Key(key)
    }
}

impl From<ComputedKey> for Dependency {
    fn from(key: ComputedKey) -> Self {
        Dependency::Computed(key)
    }
}

/// A key whose value is a function of other keys.
#[derive(Clone)]
pub struct ComputedKey {
    cache_key: String,
    dependencies: Vec<Dependency>,
    compute: ComputeFn,
}

impl ComputedKey {
    /// `compute` only runs once every dependency has a value.
    pub fn new<I, D, F>(cache_key: impl Into<String>, dependencies: I, compute: F) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            cache_key: cache_key.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            compute: Arc::new(compute),
        }
    }

    /// Key the computed value is cached and delivered under.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn compute(&self, values: &[Value]) -> Value {
        (self.compute)(values)
    }

    /// Task ID of the one-time dependency setup.
    pub(crate) fn setup_task_id(&self) -> String {
        format!("computeKey:{}", self.cache_key)
    }
}

impl std::fmt::Debug for ComputedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedKey")
            .field("cache_key", &self.cache_key)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependencies_keep_order() {
        let sorted = ComputedKey::new("sorted", ["report_"], |values| values[0].clone());
        let count = ComputedKey::new(
            "count",
            [Dependency::from(sorted.clone()), Dependency::from("session")],
            |values| json!(values.len()),
        );

        assert_eq!(count.cache_key(), "count");
        assert!(matches!(
            &count.dependencies()[0],
            Dependency::Computed(key) if key.cache_key() == "sorted"
        ));
        assert!(matches!(&count.dependencies()[1], Dependency::Key(key) if key == "session"));
        assert_eq!(count.setup_task_id(), "computeKey:count");
    }

    #[test]
    fn test_compute_receives_values() {
        let total = ComputedKey::new("total", ["a", "b"], |values| {
            json!(values.iter().filter_map(Value::as_i64).sum::<i64>())
        });
        assert_eq!(total.compute(&[json!(2), json!(3)]), json!(5));
    }
}
