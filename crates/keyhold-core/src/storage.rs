#![forbid(unsafe_code)]

//! Capability trait over the durable key-value medium, plus the in-memory
//! backend and the prefixing wrapper.
//!
//! The engine never talks to a medium directly: it goes through
//! [`StorageBackend`], so any conforming implementation is substitutable,
//! including [`MemoryStorage`] as a stand-in for tests and non-persistent
//! use. [`PrefixedStorage`] layers key namespacing over any backend so the
//! engine can keep operating on unprefixed keys.
//!
//! # Invariants
//!
//! 1. `get` after `set` for the same key returns the stored string until a
//!    later `set`/`remove`.
//! 2. `poll_external` yields only changes made *outside* the handle being
//!    polled (another process, or an injected simulation); a backend's own
//!    `set`/`remove` calls never echo back.
//! 3. Events are drained: each event is delivered to exactly one poller.
//!
//! # Failure Modes
//!
//! - A backend without any cross-process change channel keeps the default
//!   `poll_external`, which yields nothing; cross-process sync is then a
//!   no-op, never an error.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::error::StorageError;

/// A key changed in the underlying medium outside this process.
///
/// `value` is the new stored string, or `None` when the key was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    pub key: String,
    pub value: Option<String>,
}

/// Capability trait for the durable key-value medium.
///
/// All operations are synchronous. Implementations use interior mutability
/// (`Rc<RefCell<..>>`) so shared handles can coexist in the single-threaded
/// cooperative model.
pub trait StorageBackend {
    /// The stored string for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Durably record `value` under `key`.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Drop the entry for `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Drain change events produced outside this handle.
    ///
    /// Backends without a cross-process signal keep this default and yield
    /// nothing.
    fn poll_external(&self) -> Vec<ExternalChange> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage — in-memory stand-in
// ---------------------------------------------------------------------------

/// In-memory backend. Cloning shares the underlying map, so a test can keep
/// a handle to the same medium the store uses.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Rc<RefCell<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, String>,
    external: VecDeque<ExternalChange>,
}

impl MemoryStorage {
    /// Create an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a change made by another process: apply it to the medium and
    /// queue the event for the next `poll_external`.
    pub fn push_external(&self, key: impl Into<String>, value: Option<&str>) {
        let key = key.into();
        let value = value.map(str::to_owned);
        let mut inner = self.inner.borrow_mut();
        match &value {
            Some(v) => {
                inner.entries.insert(key.clone(), v.clone());
            }
            None => {
                inner.entries.remove(&key);
            }
        }
        inner.external.push_back(ExternalChange { key, value });
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Whether the medium holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.borrow().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .borrow_mut()
            .entries
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.borrow_mut().entries.remove(key);
        Ok(())
    }

    fn poll_external(&self) -> Vec<ExternalChange> {
        self.inner.borrow_mut().external.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// PrefixedStorage — transparent key namespacing
// ---------------------------------------------------------------------------

/// Wraps a backend and prefixes every key, so independent stores can share
/// one medium without colliding. External change events are filtered down to
/// this prefix and delivered with the prefix stripped; foreign keys never
/// leak through.
#[derive(Clone)]
pub struct PrefixedStorage {
    prefix: String,
    inner: Rc<dyn StorageBackend>,
}

impl PrefixedStorage {
    /// Wrap `inner`, prefixing every key with `prefix`.
    pub fn new(inner: Rc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl std::fmt::Debug for PrefixedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixedStorage")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl StorageBackend for PrefixedStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(&self.prefixed(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set(&self.prefixed(key), value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(&self.prefixed(key))
    }

    fn poll_external(&self) -> Vec<ExternalChange> {
        self.inner
            .poll_external()
            .into_iter()
            .filter_map(|change| {
                change.key.strip_prefix(&self.prefix).map(|key| ExternalChange {
                    key: key.to_string(),
                    value: change.value,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_get_set_remove() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k").unwrap(), None);

        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").unwrap(), Some("v".to_string()));

        storage.remove("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
        // Removing again is fine.
        storage.remove("k").unwrap();
    }

    #[test]
    fn memory_clone_shares_medium() {
        let storage = MemoryStorage::new();
        let handle = storage.clone();
        storage.set("k", "v").unwrap();
        assert_eq!(handle.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn memory_own_writes_do_not_echo_as_external() {
        let storage = MemoryStorage::new();
        storage.set("k", "v").unwrap();
        assert!(storage.poll_external().is_empty());
    }

    #[test]
    fn memory_external_injection_applies_and_queues() {
        let storage = MemoryStorage::new();
        storage.push_external("k", Some("42"));

        assert_eq!(storage.get("k").unwrap(), Some("42".to_string()));
        let events = storage.poll_external();
        assert_eq!(
            events,
            vec![ExternalChange {
                key: "k".into(),
                value: Some("42".into()),
            }]
        );
        // Drained.
        assert!(storage.poll_external().is_empty());
    }

    #[test]
    fn memory_external_removal() {
        let storage = MemoryStorage::new();
        storage.set("k", "v").unwrap();
        storage.push_external("k", None);

        assert_eq!(storage.get("k").unwrap(), None);
        assert_eq!(
            storage.poll_external(),
            vec![ExternalChange {
                key: "k".into(),
                value: None,
            }]
        );
    }

    #[test]
    fn prefixed_operations_land_under_prefix() {
        let medium = MemoryStorage::new();
        let prefixed = PrefixedStorage::new(Rc::new(medium.clone()), "app1-");

        prefixed.set("x", "1").unwrap();
        assert_eq!(medium.get("app1-x").unwrap(), Some("1".to_string()));
        assert_eq!(prefixed.get("x").unwrap(), Some("1".to_string()));

        prefixed.remove("x").unwrap();
        assert_eq!(medium.get("app1-x").unwrap(), None);
    }

    #[test]
    fn prefixes_isolate_two_wrappers_over_one_medium() {
        let medium: Rc<dyn StorageBackend> = Rc::new(MemoryStorage::new());
        let app1 = PrefixedStorage::new(Rc::clone(&medium), "app1-");
        let app2 = PrefixedStorage::new(Rc::clone(&medium), "app2-");

        app1.set("x", "1").unwrap();
        assert_eq!(app2.get("x").unwrap(), None);
    }

    #[test]
    fn external_events_are_filtered_and_stripped() {
        let medium = MemoryStorage::new();
        let prefixed = PrefixedStorage::new(Rc::new(medium.clone()), "app1-");

        medium.push_external("app1-x", Some("1"));
        medium.push_external("app2-x", Some("2"));

        let events = prefixed.poll_external();
        assert_eq!(
            events,
            vec![ExternalChange {
                key: "x".into(),
                value: Some("1".into()),
            }]
        );
    }

    #[test]
    fn empty_prefix_passes_keys_through() {
        let medium = MemoryStorage::new();
        let prefixed = PrefixedStorage::new(Rc::new(medium.clone()), "");

        prefixed.set("x", "1").unwrap();
        assert_eq!(medium.get("x").unwrap(), Some("1".to_string()));

        medium.push_external("y", Some("2"));
        assert_eq!(prefixed.poll_external().len(), 1);
    }
}
