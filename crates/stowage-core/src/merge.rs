//! Merge engine
//!
//! Pure functions computing the result of applying partial updates to a JSON
//! value. Objects merge key by key, arrays and primitives replace wholesale,
//! and `null` nested inside an object deletes that field.
//!
//! Batching several changes for one key without knowing the stored value is
//! handled by [`merge_and_mark_changes`]. Internally every change is lowered
//! to a [`Change`] tree (`Delete`, `Replace`, `Merge`) so that "deleted and
//! then recreated within the batch" is an explicit `Replace` node instead of
//! a sentinel field smuggled through the data. The plain JSON form and the
//! replace-null patches are produced only at the boundary.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Options for [`merge_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Drop keys whose merged value is `null`, recursively
    pub remove_nested_nulls: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { remove_nested_nulls: true }
    }
}

impl MergeOptions {
    /// Keep `null` fields in the result (used when combining patches).
    pub fn keep_nulls() -> Self {
        Self { remove_nested_nulls: false }
    }
}

/// Combine `source` into `target`.
///
/// `None` stands for "no value". A `None` source leaves the target untouched.
/// An object source is merged into an object target field by field; any other
/// source (array, primitive, `null`) replaces the target. An object merged
/// into a non-object target starts from an empty object.
pub fn merge_value(
    target: Option<&Value>,
    source: Option<&Value>,
    options: MergeOptions,
) -> Option<Value> {
    let Some(source) = source else {
        return target.cloned();
    };
    match source {
        Value::Object(source_map) => Some(Value::Object(merge_object(target, source_map, options))),
        other => Some(other.clone()),
    }
}

fn merge_object(
    target: Option<&Value>,
    source: &Map<String, Value>,
    options: MergeOptions,
) -> Map<String, Value> {
    let target_map = target.and_then(Value::as_object);
    let mut destination = Map::new();

    if let Some(target_map) = target_map {
        for (key, target_value) in target_map {
            let source_is_null = matches!(source.get(key), Some(Value::Null));
            let omit = options.remove_nested_nulls && (target_value.is_null() || source_is_null);
            if !omit {
                destination.insert(key.clone(), target_value.clone());
            }
        }
    }

    for (key, source_value) in source {
        match source_value {
            Value::Null => {
                if !options.remove_nested_nulls {
                    destination.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(nested) => {
                let target_value = target_map.and_then(|t| t.get(key));
                let merged = merge_object(target_value, nested, options);
                destination.insert(key.clone(), Value::Object(merged));
            }
            other => {
                destination.insert(key.clone(), other.clone());
            }
        }
    }

    destination
}

/// Strip `null` fields at every depth of an object. Non-objects are returned as-is.
pub fn remove_nested_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            Value::Object(merge_object(Some(value), map, MergeOptions::default()))
        }
        other => other.clone(),
    }
}

/// Apply `changes` in order on top of `existing`.
///
/// The last change that is not an object (array, primitive or `null`)
/// discards everything before it, including `existing`; the object changes
/// after it are merged onto it. The result never contains nested nulls, and
/// a top-level `null` comes back as `None`.
pub fn merge_changes(changes: &[Value], existing: Option<&Value>) -> Option<Value> {
    let (mut accumulated, rest) = match changes.iter().rposition(|change| !change.is_object()) {
        Some(index) => {
            let base = &changes[index];
            let base = if base.is_null() { None } else { Some(base.clone()) };
            (base, &changes[index + 1..])
        }
        None => (existing.cloned(), changes),
    };

    for change in rest {
        accumulated = merge_value(accumulated.as_ref(), Some(change), MergeOptions::default());
    }

    accumulated.filter(|value| !value.is_null()).map(|value| remove_nested_nulls(&value))
}

/// A nested object that must replace, not merge with, the stored value at `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceNullPatch {
    /// Object keys from the root to the replaced object
    pub path: Vec<String>,
    /// The full replacement, without nulls
    pub value: Value,
}

/// Internal change representation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Change {
    /// Remove the value at this position
    Delete,
    /// Overwrite the value at this position
    Replace(Value),
    /// Merge these fields into the object at this position
    Merge(IndexMap<String, Change>),
}

impl Change {
    pub(crate) fn from_value(value: &Value) -> Change {
        match value {
            Value::Null => Change::Delete,
            Value::Object(map) => Change::Merge(
                map.iter()
                    .map(|(key, nested)| (key.clone(), Change::from_value(nested)))
                    .collect(),
            ),
            other => Change::Replace(other.clone()),
        }
    }

    /// The change equivalent to applying `self` and then `next`.
    pub(crate) fn then(self, next: Change) -> Change {
        match (self, next) {
            (_, Change::Delete) => Change::Delete,
            (_, Change::Replace(value)) => Change::Replace(value),
            (Change::Merge(mut fields), Change::Merge(next_fields)) => {
                for (key, next_change) in next_fields {
                    let composed = match fields.shift_remove(&key) {
                        Some(previous) => previous.then(next_change),
                        None => next_change,
                    };
                    fields.insert(key, composed);
                }
                Change::Merge(fields)
            }
            (Change::Replace(base @ Value::Object(_)), merge @ Change::Merge(_)) => {
                Change::Replace(merge.apply(Some(&base)).unwrap_or(Value::Null))
            }
            // Deleted (or a non-object) earlier in the batch: whatever the stored
            // value holds here must not leak into the recreated object.
            (_, merge @ Change::Merge(_)) => {
                Change::Replace(merge.apply(None).unwrap_or(Value::Null))
            }
        }
    }

    /// Apply to a concrete value. The result carries no nested nulls.
    pub(crate) fn apply(&self, existing: Option<&Value>) -> Option<Value> {
        match self {
            Change::Delete => None,
            Change::Replace(value) => Some(remove_nested_nulls(value)),
            Change::Merge(fields) => {
                let mut merged: Map<String, Value> = match existing {
                    Some(Value::Object(map)) => map
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    _ => Map::new(),
                };
                for (key, change) in fields {
                    let next = change.apply(merged.get(key));
                    match next {
                        Some(value) => {
                            merged.insert(key.clone(), value);
                        }
                        None => {
                            merged.remove(key);
                        }
                    }
                }
                Some(Value::Object(merged))
            }
        }
    }

    /// Plain JSON form: deletes become `null`, replacements appear as their value.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Change::Delete => Value::Null,
            Change::Replace(value) => value.clone(),
            Change::Merge(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, change)| (key.clone(), change.to_value()))
                    .collect(),
            ),
        }
    }

    fn collect_patches(&self, path: &mut Vec<String>, patches: &mut Vec<ReplaceNullPatch>) {
        match self {
            Change::Merge(fields) => {
                for (key, change) in fields {
                    path.push(key.clone());
                    change.collect_patches(path, patches);
                    path.pop();
                }
            }
            Change::Replace(value @ Value::Object(_)) if !path.is_empty() => {
                patches.push(ReplaceNullPatch {
                    path: path.clone(),
                    value: remove_nested_nulls(value),
                });
            }
            _ => {}
        }
    }
}

/// Several changes for one key flattened into a single change.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkedChanges {
    change: Change,
}

impl MarkedChanges {
    /// Wrap a single plain change.
    pub fn from_value(value: &Value) -> Self {
        Self { change: Change::from_value(value) }
    }

    /// The flattened change as plain JSON. Nested `null`s are kept, since they
    /// still have to delete fields of the stored value.
    pub fn result(&self) -> Value {
        self.change.to_value()
    }

    /// Objects recreated after a delete in the batch, by path.
    pub fn replace_null_patches(&self) -> Vec<ReplaceNullPatch> {
        let mut patches = Vec::new();
        self.change.collect_patches(&mut Vec::new(), &mut patches);
        patches
    }

    /// Apply the whole batch to a stored value.
    pub fn apply_to(&self, existing: Option<&Value>) -> Option<Value> {
        self.change.apply(existing)
    }

    /// The batch overwrites the key entirely (its final top-level change was
    /// a delete, a primitive, an array, or an object recreated after a delete).
    pub fn is_replacement(&self) -> bool {
        !matches!(self.change, Change::Merge(_))
    }

    /// The batch ends with the key removed.
    pub fn is_delete(&self) -> bool {
        matches!(self.change, Change::Delete)
    }

    /// Append a later batch.
    pub fn then(self, next: MarkedChanges) -> MarkedChanges {
        MarkedChanges { change: self.change.then(next.change) }
    }
}

/// Flatten same-key changes into one, in order, without a base value.
///
/// Returns `None` for an empty list.
pub fn merge_and_mark_changes(changes: &[Value]) -> Option<MarkedChanges> {
    let mut iter = changes.iter();
    let first = Change::from_value(iter.next()?);
    let change = iter.fold(first, |accumulated, next| accumulated.then(Change::from_value(next)));
    Some(MarkedChanges { change })
}

/// Merge a flattened change and its replace-null patches into a stored value.
///
/// This is what a storage backend does for `merge_item`: a JSON merge patch
/// of `change`, then each patch overwrites the object at its path.
pub fn apply_patch(
    existing: Option<&Value>,
    change: &Value,
    patches: &[ReplaceNullPatch],
) -> Option<Value> {
    let mut merged = Change::from_value(change).apply(existing)?;
    for patch in patches {
        replace_at_path(&mut merged, &patch.path, patch.value.clone());
    }
    Some(merged)
}

fn replace_at_path(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for key in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

/// Array-ness mismatch between a stored value and an update, as
/// `(existing_type, new_type)`. Absent or `null` values are compatible with anything.
pub fn check_compatibility(
    existing: Option<&Value>,
    new_value: &Value,
) -> Option<(&'static str, &'static str)> {
    let existing = existing.filter(|value| !value.is_null())?;
    if new_value.is_null() {
        return None;
    }
    let kind = |value: &Value| if value.is_array() { "array" } else { "non-array" };
    let (existing_kind, new_kind) = (kind(existing), kind(new_value));
    (existing_kind != new_kind).then_some((existing_kind, new_kind))
}
