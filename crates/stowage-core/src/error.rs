//! Error types for Stowage operations
//!
//! Two layers: [`StorageError`] is what a storage backend reports, already
//! classified by the backend so the coordinator never inspects message text.
//! [`StoreError`] is what callers of the store see.

use thiserror::Error;

/// Failure reported by a storage backend.
///
/// The variant decides how the persistence coordinator reacts:
/// `Corrupt` is rethrown, `QuotaExceeded` evicts and retries,
/// `Transient` retries without eviction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend ran out of space for the write
    #[error("storage quota exceeded: {message}")]
    QuotaExceeded {
        /// Backend-provided description
        message: String,
    },

    /// The backend rejected the payload as structurally invalid
    #[error("storage rejected invalid data{}: {message}", key_suffix(.key))]
    Corrupt {
        /// Key whose payload was rejected, when known
        key: Option<String>,
        /// Backend-provided description
        message: String,
    },

    /// Any other failure; may succeed on retry
    #[error("transient storage failure: {message}")]
    Transient {
        /// Backend-provided description
        message: String,
    },
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" for key '{}'", key),
        None => String::new(),
    }
}

impl StorageError {
    /// Shorthand for a quota failure.
    pub fn quota(message: impl Into<String>) -> Self {
        StorageError::QuotaExceeded { message: message.into() }
    }

    /// Shorthand for a corruption failure.
    pub fn corrupt(key: Option<&str>, message: impl Into<String>) -> Self {
        StorageError::Corrupt { key: key.map(str::to_owned), message: message.into() }
    }

    /// Shorthand for a transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        StorageError::Transient { message: message.into() }
    }

    /// Retrying cannot help; the error must reach the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Corrupt { .. })
    }

    /// Freeing space may let the write succeed.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Errors surfaced by the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Fatal backend failure propagated to the writer
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// `Cache::merge` was given something other than a key/value object
    #[error("data passed to cache.merge() must be an Object of key/value pairs")]
    InvalidMergeInput,

    /// A collection key was required
    #[error("Invalid '{key}' key provided, only collection keys are allowed.")]
    NotACollectionKey {
        /// The offending key
        key: String,
    },

    /// A collection member key was required
    #[error("Invalid '{key}' key provided, only collection member keys are allowed.")]
    NotACollectionMemberKey {
        /// The offending key
        key: String,
    },

    /// Unknown method in an update record
    #[error("Invalid method {method} in update.")]
    InvalidUpdateMethod {
        /// Method name as received
        method: String,
    },

    /// Key in an update record was not a string
    #[error("Invalid {kind} key provided in update. Key must be of type string.")]
    InvalidUpdateKey {
        /// JSON type name of the key that was received
        kind: &'static str,
    },

    /// Value in an update record was not an object where one is required
    #[error("Invalid value provided in {method}. {method} value must be of type object.")]
    InvalidUpdateValue {
        /// Method whose payload was malformed
        method: &'static str,
    },

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for storage backend operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NotACollectionKey { key: "report".into() };
        assert_eq!(
            err.to_string(),
            "Invalid 'report' key provided, only collection keys are allowed."
        );

        let err = StoreError::InvalidUpdateValue { method: "multiset" };
        assert_eq!(
            err.to_string(),
            "Invalid value provided in multiset. multiset value must be of type object."
        );

        let err = StorageError::corrupt(Some("k"), "bad json");
        assert_eq!(err.to_string(), "storage rejected invalid data for key 'k': bad json");
    }

    #[test]
    fn test_classification() {
        assert!(StorageError::corrupt(None, "x").is_fatal());
        assert!(!StorageError::quota("full").is_fatal());
        assert!(StorageError::quota("full").is_quota());
        assert!(!StorageError::transient("busy").is_quota());
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: StoreError = StorageError::quota("full").into();
        assert!(matches!(err, StoreError::Storage(StorageError::QuotaExceeded { .. })));
        assert_eq!(err.to_string(), "storage quota exceeded: full");
    }
}
