#![forbid(unsafe_code)]

//! Store configuration.
//!
//! A [`StoreConfig`] is consumed once, by [`Store::new`](crate::Store::new)
//! (or by [`configure`](crate::store::configure) for the global store).
//! Slots resolve against the configuration they were created under; there is
//! no retroactive reconfiguration.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use keyhold_core::schema::AssertFn;
use keyhold_core::{Codec, FileStorage, JsonCodec, KeyMatcher, Schema, StorageBackend, Value};

/// Default path of the persistent medium, relative to the working directory.
pub const DEFAULT_STORE_PATH: &str = "keyhold-store.json";

/// How long a slot with no subscribers is retained before it is reclaimed.
///
/// The grace period lets a consumer unbind and immediately re-bind (a
/// transient unmount/remount) without losing the slot.
pub const DEFAULT_RETAIN_IDLE: Duration = Duration::from_millis(200);

/// Process-level store settings: key prefix, medium, codec, schemas, and the
/// idle-slot grace period.
#[derive(Clone)]
pub struct StoreConfig {
    /// Prefix applied to every key at the storage boundary.
    pub key_prefix: String,
    /// The durable key-value medium.
    pub storage: Rc<dyn StorageBackend>,
    /// The value ⇄ string codec.
    pub codec: Rc<dyn Codec>,
    /// Schemas registered up front (more can be appended on the store).
    pub schemas: Vec<Schema>,
    /// Grace period before a subscriber-less slot is reclaimed.
    pub retain_idle: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            storage: Rc::new(FileStorage::new(DEFAULT_STORE_PATH)),
            codec: Rc::new(JsonCodec),
            schemas: Vec::new(),
            retain_idle: DEFAULT_RETAIN_IDLE,
        }
    }
}

impl StoreConfig {
    /// Start from the defaults: no prefix, [`JsonCodec`], a [`FileStorage`]
    /// at [`DEFAULT_STORE_PATH`], no schemas.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Replace the storage backend.
    #[must_use]
    pub fn with_storage(mut self, storage: Rc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the codec (as a whole encode/decode pair).
    #[must_use]
    pub fn with_codec(mut self, codec: Rc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Append one schema.
    #[must_use]
    pub fn with_schema(
        mut self,
        matcher: impl Into<KeyMatcher>,
        default: Value,
        assert: Option<AssertFn>,
    ) -> Self {
        self.schemas.push(Schema::new(matcher, default, assert));
        self
    }

    /// Append a batch of schemas.
    #[must_use]
    pub fn with_schemas(mut self, schemas: impl IntoIterator<Item = Schema>) -> Self {
        self.schemas.extend(schemas);
        self
    }

    /// Set the idle-slot grace period.
    #[must_use]
    pub fn with_retain_idle(mut self, retain_idle: Duration) -> Self {
        self.retain_idle = retain_idle;
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("key_prefix", &self.key_prefix)
            .field("schemas", &self.schemas.len())
            .field("retain_idle", &self.retain_idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyhold_core::MemoryStorage;
    use serde_json::json;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.key_prefix, "");
        assert!(config.schemas.is_empty());
        assert_eq!(config.retain_idle, DEFAULT_RETAIN_IDLE);
    }

    #[test]
    fn builder_chain() {
        let config = StoreConfig::new()
            .with_key_prefix("app-")
            .with_storage(Rc::new(MemoryStorage::new()))
            .with_schema("counter", json!(0), None)
            .with_retain_idle(Duration::ZERO);

        assert_eq!(config.key_prefix, "app-");
        assert_eq!(config.schemas.len(), 1);
        assert_eq!(config.retain_idle, Duration::ZERO);
    }
}
