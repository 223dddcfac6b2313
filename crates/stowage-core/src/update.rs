//! Update records
//!
//! `Store::update` takes a list of serializable records, usually produced
//! far from the store (for example decoded from a server response). Each
//! record is validated on its own; an invalid one is reported and skipped
//! while the rest of the list still applies.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Method names accepted in [`Update::method`].
pub mod method {
    pub const SET: &str = "set";
    pub const MERGE: &str = "merge";
    pub const MULTI_SET: &str = "multiset";
    pub const MERGE_COLLECTION: &str = "mergecollection";
    pub const SET_COLLECTION: &str = "setcollection";
    pub const CLEAR: &str = "clear";
}

/// One operation of an `update` batch, in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub method: String,
    /// Target key; ignored by `multiset` and `clear`
    #[serde(default)]
    pub key: Value,
    /// `None` when the field is missing; a present `null` is `Some(Value::Null)`
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Keeps an explicit `null` apart from a missing field.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Update {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self { method: method::SET.into(), key: Value::String(key.into()), value: Some(value) }
    }

    pub fn merge(key: impl Into<String>, value: Value) -> Self {
        Self { method: method::MERGE.into(), key: Value::String(key.into()), value: Some(value) }
    }

    pub fn multi_set(entries: Map<String, Value>) -> Self {
        Self {
            method: method::MULTI_SET.into(),
            key: Value::Null,
            value: Some(Value::Object(entries)),
        }
    }

    pub fn merge_collection(
        collection_key: impl Into<String>,
        members: Map<String, Value>,
    ) -> Self {
        Self {
            method: method::MERGE_COLLECTION.into(),
            key: Value::String(collection_key.into()),
            value: Some(Value::Object(members)),
        }
    }

    pub fn set_collection(collection_key: impl Into<String>, members: Map<String, Value>) -> Self {
        Self {
            method: method::SET_COLLECTION.into(),
            key: Value::String(collection_key.into()),
            value: Some(Value::Object(members)),
        }
    }

    pub fn clear() -> Self {
        Self { method: method::CLEAR.into(), key: Value::Null, value: None }
    }

    /// Check the record and convert it into an operation.
    pub(crate) fn validate(&self) -> StoreResult<Operation> {
        let name = self.method.as_str();
        match name {
            method::CLEAR => return Ok(Operation::Clear),
            method::MULTI_SET => {
                return Ok(Operation::MultiSet(object_value(method::MULTI_SET, &self.value)?))
            }
            method::SET | method::MERGE | method::MERGE_COLLECTION | method::SET_COLLECTION => {}
            other => return Err(StoreError::InvalidUpdateMethod { method: other.to_owned() }),
        }

        let key = match &self.key {
            Value::String(key) => key.clone(),
            other => return Err(StoreError::InvalidUpdateKey { kind: type_name(other) }),
        };

        Ok(match name {
            method::SET => Operation::Set { key, value: self.value.clone() },
            method::MERGE => Operation::Merge { key, value: self.value.clone() },
            method::MERGE_COLLECTION => {
                let members = object_value(method::MERGE_COLLECTION, &self.value)?;
                Operation::MergeCollection { key, members }
            }
            _ => {
                let members = object_value(method::SET_COLLECTION, &self.value)?;
                Operation::SetCollection { key, members }
            }
        })
    }
}

fn object_value(method: &'static str, value: &Option<Value>) -> StoreResult<Map<String, Value>> {
    match value {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(StoreError::InvalidUpdateValue { method }),
    }
}

/// Type name of a JSON value, as a JavaScript `typeof` would report it.
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

/// A validated update record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operation {
    Set { key: String, value: Option<Value> },
    Merge { key: String, value: Option<Value> },
    MultiSet(Map<String, Value>),
    MergeCollection { key: String, members: Map<String, Value> },
    SetCollection { key: String, members: Map<String, Value> },
    Clear,
}
