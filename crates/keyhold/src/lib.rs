#![forbid(unsafe_code)]

//! Keyed, persistent, cross-consumer reactive value store.
//!
//! Any number of independent consumers bind to the same string key and share
//! one authoritative value:
//!
//! - [`Store`]: the facade for binding, reading, writing, and configuring.
//! - [`SlotRegistry`]: the engine, with one live slot per key, resolution
//!   with validation and fallback, synchronous fan-out, deferred cleanup.
//! - [`BindOptions`] / [`Binding`] / [`Writer`] / [`Subscription`]: the
//!   consumer-side surface a UI binding layer builds on.
//!
//! Codec, schemas, and storage backends come from [`keyhold-core`](keyhold_core)
//! and are re-exported here.
//!
//! # Architecture
//!
//! Single-threaded cooperative model, `Rc<RefCell<..>>` ownership throughout.
//! Every operation runs synchronously to completion on the calling thread; a
//! write persists and notifies all subscribers of its key before returning.
//! Cross-process convergence rides on the storage backend's external-change
//! events, drained by [`Store::sync_external`] once per host turn and never
//! applied reentrantly with an in-flight write.
//!
//! # Invariants
//!
//! 1. At most one slot per key; all binds to a key see the same value.
//! 2. Fan-out is synchronous, in registration order, exactly once per
//!    subscriber per change.
//! 3. A corrupt or rejected persisted entry never reaches a consumer: the
//!    value falls back (local default → schema default → null) and the
//!    stored entry is overwritten with the fallback.
//! 4. Write handles are identity-stable across re-binds with the same `Rc`
//!    identities for the local default and validator.
//!
//! # Example
//!
//! ```
//! use keyhold::{BindOptions, Store, StoreConfig};
//! use keyhold::storage::MemoryStorage;
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! let store = Store::new(
//!     StoreConfig::new().with_storage(Rc::new(MemoryStorage::new())),
//! );
//! store.register_schema("counter", json!(0), None);
//!
//! let binding = store.bind("counter", BindOptions::new(), |v| {
//!     println!("counter is now {v}");
//! });
//! assert_eq!(**binding.value(), json!(0));
//!
//! binding.writer().update(|prev| json!(prev.as_i64().unwrap_or(0) + 1))?;
//! assert_eq!(*store.read("counter"), json!(1));
//! # Ok::<(), keyhold::StoreError>(())
//! ```

pub mod config;
pub mod slot;
pub mod store;

pub use keyhold_core::{codec, error, file, schema, storage};
pub use keyhold_core::{
    AssertFn, Codec, CodecError, ExternalChange, FileStorage, JsonCodec, KeyMatcher,
    MemoryStorage, PrefixedStorage, Schema, SchemaRegistry, StorageBackend, StorageError, Value,
};

pub use config::{DEFAULT_RETAIN_IDLE, DEFAULT_STORE_PATH, StoreConfig};
pub use slot::{BindOptions, Binding, ChangeFn, SlotRegistry, StoreError, Subscription, Writer};
pub use store::{
    Store, bind, configure, read_value, register_schema, sync_external, write_value,
};
