#![forbid(unsafe_code)]

//! The store facade: explicit handles, plus a thread-local global store.
//!
//! [`Store`] is a cheap clone-able handle over one slot registry. Hosts that
//! can thread a handle through their composition should do so: construction
//! from a [`StoreConfig`] is the one-shot configuration boundary, and
//! everything a store resolves is pinned to that configuration.
//!
//! For hosts that cannot (the classic "no shared ancestor" situation this
//! store exists for), a thread-local global store offers the same API as
//! free functions: [`configure`] once at startup, then [`bind`],
//! [`read_value`], [`write_value`] anywhere. Configuring after the global
//! store has been used is logged and swaps the store for *future* binds
//! only; bindings already handed out keep the store they were created
//! against.

use std::cell::RefCell;
use std::rc::Rc;

use keyhold_core::schema::AssertFn;
use keyhold_core::{KeyMatcher, Value};

use crate::config::StoreConfig;
use crate::slot::{BindOptions, Binding, SlotRegistry, StoreError};

/// Handle to a value store. Clones share the same slots.
#[derive(Debug, Clone)]
pub struct Store {
    registry: SlotRegistry,
}

impl Store {
    /// Build a store from a consumed configuration.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            registry: SlotRegistry::new(config),
        }
    }

    /// The thread-local global store, created from `StoreConfig::default()`
    /// on first use unless [`configure`] ran earlier.
    #[must_use]
    pub fn global() -> Store {
        GLOBAL_STORE.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| Store::new(StoreConfig::default()))
                .clone()
        })
    }

    /// Subscribe to `key`. See [`SlotRegistry::bind`].
    pub fn bind(
        &self,
        key: &str,
        options: BindOptions,
        on_change: impl Fn(&Rc<Value>) + 'static,
    ) -> Binding {
        self.registry.bind(key, options, on_change)
    }

    /// Passive read. See [`SlotRegistry::read`].
    #[must_use]
    pub fn read(&self, key: &str) -> Rc<Value> {
        self.registry.read(key)
    }

    /// Write a value. See [`SlotRegistry::write`].
    pub fn write(&self, key: &str, value: Value) -> Result<Rc<Value>, StoreError> {
        self.registry.write(key, value)
    }

    /// Write via an updater. See [`SlotRegistry::write_with`].
    pub fn write_with(
        &self,
        key: &str,
        f: impl FnOnce(&Value) -> Value,
    ) -> Result<Rc<Value>, StoreError> {
        self.registry.write_with(key, f)
    }

    /// Drop the persisted entry for `key` and reset its live slot.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.registry.remove(key)
    }

    /// Append a schema. Existing slots are unaffected.
    pub fn register_schema(
        &self,
        matcher: impl Into<KeyMatcher>,
        default: Value,
        assert: Option<AssertFn>,
    ) {
        self.registry.register_schema(matcher, default, assert);
    }

    /// Apply pending external changes. See [`SlotRegistry::sync_external`].
    pub fn sync_external(&self) {
        self.registry.sync_external();
    }

    /// Number of live slots.
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.registry.active_slots()
    }
}

thread_local! {
    static GLOBAL_STORE: RefCell<Option<Store>> = const { RefCell::new(None) };
}

/// Configure the thread-local global store. Call once, before first use.
///
/// Calling after the global store has been used logs a warning and replaces
/// the store for future binds; bindings already handed out keep the previous
/// store and stay fully functional.
pub fn configure(config: StoreConfig) {
    GLOBAL_STORE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            tracing::warn!(
                "global store configured after first use; existing bindings keep the previous store"
            );
        }
        *slot = Some(Store::new(config));
    });
}

/// Convenience: bind against the global store.
pub fn bind(
    key: &str,
    options: BindOptions,
    on_change: impl Fn(&Rc<Value>) + 'static,
) -> Binding {
    Store::global().bind(key, options, on_change)
}

/// Convenience: passive read from the global store.
#[must_use]
pub fn read_value(key: &str) -> Rc<Value> {
    Store::global().read(key)
}

/// Convenience: write to the global store.
pub fn write_value(key: &str, value: Value) -> Result<Rc<Value>, StoreError> {
    Store::global().write(key, value)
}

/// Convenience: append a schema to the global store.
pub fn register_schema(matcher: impl Into<KeyMatcher>, default: Value, assert: Option<AssertFn>) {
    Store::global().register_schema(matcher, default, assert);
}

/// Convenience: apply pending external changes on the global store.
pub fn sync_external() {
    Store::global().sync_external();
}
