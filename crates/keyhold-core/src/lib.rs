#![forbid(unsafe_code)]

//! Primitives for the keyhold value store.
//!
//! This crate provides the leaf building blocks the engine crate
//! (`keyhold`) composes into a keyed, persistent, reactive store:
//!
//! - [`Codec`]: serialize/deserialize a dynamic [`Value`] to and from the
//!   string form kept in durable storage. [`JsonCodec`] is the default.
//! - [`SchemaRegistry`]: ordered mapping from key matchers (exact strings or
//!   regular expressions) to default values and optional validators.
//! - [`StorageBackend`]: capability trait over the durable key-value medium,
//!   with [`MemoryStorage`] (in-memory stand-in) and [`FileStorage`]
//!   (JSON-file medium with cross-process change detection) implementations,
//!   plus [`PrefixedStorage`] for transparent key namespacing.
//!
//! Everything here is synchronous and single-threaded; shared handles use
//! `Rc<RefCell<..>>` ownership.

pub mod codec;
pub mod error;
pub mod file;
pub mod schema;
pub mod storage;

pub use codec::{Codec, JsonCodec};
pub use error::{CodecError, StorageError};
pub use file::FileStorage;
pub use schema::{AssertFn, KeyMatcher, Schema, SchemaRegistry};
pub use storage::{ExternalChange, MemoryStorage, PrefixedStorage, StorageBackend};

/// The dynamic value type held in slots and carried through codecs.
pub type Value = serde_json::Value;
