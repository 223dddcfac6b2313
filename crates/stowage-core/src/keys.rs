//! Key and collection-key utilities
//!
//! A collection key is a registered prefix ending in `_`; a member key is the
//! collection key followed by a non-empty member ID.

use std::collections::BTreeSet;

use crate::error::{StoreError, StoreResult};

/// Delimiter every collection key ends with.
pub const COLLECTION_DELIMITER: char = '_';

/// The set of registered collection keys.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    collection_keys: BTreeSet<String>,
}

impl KeyRegistry {
    pub fn new<I, S>(collection_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { collection_keys: collection_keys.into_iter().map(Into::into).collect() }
    }

    pub fn collection_keys(&self) -> impl Iterator<Item = &str> {
        self.collection_keys.iter().map(String::as_str)
    }

    /// True if `key` is one of the registered collection keys.
    pub fn is_collection_key(&self, key: &str) -> bool {
        self.collection_keys.contains(key)
    }

    /// Collection key that owns `key`, if any.
    ///
    /// When collection keys nest (`report_` and `report_actions_`), the
    /// longest matching prefix wins.
    pub fn owning_collection(&self, key: &str) -> Option<&str> {
        self.collection_keys
            .iter()
            .filter(|collection| is_collection_member_key(collection, key))
            .max_by_key(|collection| collection.len())
            .map(String::as_str)
    }

    /// Resolve the collection key for either a collection key or one of its members.
    pub fn get_collection_key(&self, key: &str) -> StoreResult<String> {
        if self.is_collection_key(key) {
            return Ok(key.to_owned());
        }
        self.owning_collection(key)
            .map(str::to_owned)
            .ok_or_else(|| StoreError::NotACollectionKey { key: key.to_owned() })
    }

    /// Split a member key into `(collection_key, member_id)`.
    pub fn split_collection_member_key<'a>(&self, key: &'a str) -> StoreResult<(&'a str, &'a str)> {
        match self.owning_collection(key) {
            Some(collection) => Ok(key.split_at(collection.len())),
            None => Err(StoreError::NotACollectionMemberKey { key: key.to_owned() }),
        }
    }

    /// True if `config_key` (a plain key or a collection key) covers `key`.
    pub fn is_key_match(&self, config_key: &str, key: &str) -> bool {
        if self.is_collection_key(config_key) {
            key.starts_with(config_key)
        } else {
            config_key == key
        }
    }
}

/// True if `key` is a member of `collection_key` (strictly longer, same prefix).
pub fn is_collection_member_key(collection_key: &str, key: &str) -> bool {
    key.len() > collection_key.len() && key.starts_with(collection_key)
}

/// A set of exact keys and collection prefixes, used for RAM-only and
/// evictable key declarations.
#[derive(Debug, Clone, Default)]
pub struct KeyMatcher {
    exact: hashbrown::HashSet<String>,
    prefixes: Vec<String>,
}

impl KeyMatcher {
    /// Entries that are registered collection keys match every member of
    /// that collection; anything else matches only itself.
    pub fn new<S: AsRef<str>>(entries: &[S], registry: &KeyRegistry) -> Self {
        let mut matcher = KeyMatcher::default();
        for entry in entries {
            let entry = entry.as_ref();
            if registry.is_collection_key(entry) {
                matcher.prefixes.push(entry.to_owned());
            }
            matcher.exact.insert(entry.to_owned());
        }
        matcher
    }

    pub fn matches(&self, key: &str) -> bool {
        self.exact.contains(key)
            || self.prefixes.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> KeyRegistry {
        KeyRegistry::new(["report_", "report_actions_", "test_"])
    }

    #[test]
    fn test_member_key_detection() {
        assert!(is_collection_member_key("test_", "test_1"));
        assert!(!is_collection_member_key("test_", "test_"));
        assert!(!is_collection_member_key("test_", "other_1"));
    }

    #[test]
    fn test_split_collection_member_key() {
        let keys = registry();
        assert_eq!(keys.split_collection_member_key("test_42").unwrap(), ("test_", "42"));
        assert_eq!(
            keys.split_collection_member_key("report_actions_7").unwrap(),
            ("report_actions_", "7")
        );
        assert_eq!(keys.split_collection_member_key("report_7").unwrap(), ("report_", "7"));
        assert!(matches!(
            keys.split_collection_member_key("session"),
            Err(StoreError::NotACollectionMemberKey { .. })
        ));
        // A bare collection key has no member ID
        assert!(keys.split_collection_member_key("test_").is_err());
    }

    #[test]
    fn test_get_collection_key() {
        let keys = registry();
        assert_eq!(keys.get_collection_key("test_").unwrap(), "test_");
        assert_eq!(keys.get_collection_key("test_1").unwrap(), "test_");
        assert_eq!(keys.get_collection_key("report_actions_1").unwrap(), "report_actions_");
        let err = keys.get_collection_key("session").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid 'session' key provided, only collection keys are allowed."
        );
    }

    #[test]
    fn test_is_key_match() {
        let keys = registry();
        assert!(keys.is_key_match("test_", "test_1"));
        assert!(keys.is_key_match("session", "session"));
        assert!(!keys.is_key_match("session", "session_1"));
    }

    #[test]
    fn test_key_matcher_prefixes() {
        let keys = registry();
        let matcher = KeyMatcher::new(&["test_", "session"], &keys);
        assert!(matcher.matches("test_1"));
        assert!(matcher.matches("test_"));
        assert!(matcher.matches("session"));
        assert!(!matcher.matches("sessionX"));
        assert!(!matcher.matches("report_1"));
        assert!(KeyMatcher::default().is_empty());
    }
}
