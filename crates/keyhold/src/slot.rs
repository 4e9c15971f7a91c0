#![forbid(unsafe_code)]

//! The slot registry: one live synchronization unit per key.
//!
//! A slot owns the authoritative current value for its key, the ordered set
//! of subscriber callbacks, and a cache of write handles keyed by the
//! caller-supplied default/validator identities. The registry guarantees at
//! most one slot per key, coordinates reads and writes with
//! validation-and-fallback, and fans every change out to all subscribers of
//! the key.
//!
//! # Architecture
//!
//! Single-threaded cooperative ownership: the registry and its slots live in
//! `Rc<RefCell<..>>`. No `RefCell` borrow is held across a subscriber
//! callback, so callbacks may re-enter the registry (bind, read, even write).
//! External change events are drained into a queue and applied only when no
//! dispatch is on the stack, so they can never interleave with an in-flight
//! write to the same key.
//!
//! # Invariants
//!
//! 1. At most one slot exists per key at any instant; all binds to a key
//!    observe the same current value.
//! 2. A successful write persists and notifies every current subscriber of
//!    the key, in registration order, before `set`/`update` returns.
//!    Notification is unconditional: the engine never skips "unchanged"
//!    values; any equality-based skipping belongs to the consumer.
//! 3. Write handles are identity-stable: binds to the same key with the same
//!    `Rc` identities for the local default and validator share one
//!    [`Writer`] (`Writer::same` holds) for the lifetime of the slot.
//! 4. A corrupt or rejected persisted entry never surfaces to a consumer:
//!    resolution falls through (local default → schema default → null) and
//!    the stored entry is overwritten with the resolved fallback.
//! 5. A slot with zero subscribers survives for the configured grace period
//!    and is reclaimed lazily afterwards; a bind during the grace period
//!    cancels the reclaim.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Decode error on resolve | Corrupt persisted string | Fallback + overwrite, `warn` |
//! | Validator rejects persisted value | Stale schema on disk | Fallback + overwrite, `warn` |
//! | Encode/persist error on write | Quota, I/O | In-memory value updated and subscribers notified, then `Err` to the writer; memory and disk diverge until a later successful write |
//! | Write through a dropped store | `Writer` outlived the registry | [`StoreError::Closed`] |
//! | Subscriber callback panics | Consumer bug | Propagates to the caller of the write |

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use web_time::Instant;

use keyhold_core::schema::AssertFn;
use keyhold_core::{
    Codec, CodecError, ExternalChange, PrefixedStorage, SchemaRegistry, StorageBackend,
    StorageError, Value,
};

use crate::config::StoreConfig;

/// Subscriber callback, invoked with the slot's new value snapshot.
pub type ChangeFn = Rc<dyn Fn(&Rc<Value>)>;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors surfaced by the write path.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The codec could not encode the new value. The in-memory value was
    /// already updated and subscribers notified.
    Encode { key: String, source: CodecError },
    /// The backend rejected the write. The in-memory value was already
    /// updated and subscribers notified; durability was not achieved.
    Persistence { key: String, source: StorageError },
    /// The write handle outlived its store.
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { key, source } => {
                write!(f, "could not encode value for key '{key}': {source}")
            }
            Self::Persistence { key, source } => {
                write!(f, "could not persist key '{key}': {source}")
            }
            Self::Closed => write!(f, "the store behind this writer was dropped"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode { source, .. } => Some(source),
            Self::Persistence { source, .. } => Some(source),
            Self::Closed => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BindOptions
// ---------------------------------------------------------------------------

/// Per-bind overrides: a local default and a local validator.
///
/// Both are identity parameters: the registry compares them by `Rc` pointer,
/// not by value, when deciding whether two binds are "the same". Reuse one
/// `Rc` across binds to keep the write handle stable; wrapping a fresh `Rc`
/// per call deliberately requests a fresh handle.
///
/// A local validator *overrides* the schema validator for this binding's
/// resolutions; a local default shadows the schema default the same way.
#[derive(Clone, Default)]
pub struct BindOptions {
    /// Seed value when nothing usable is persisted. Beats the schema default.
    pub default: Option<Rc<Value>>,
    /// Validator for persisted values. Beats the schema validator.
    pub assert: Option<AssertFn>,
}

impl BindOptions {
    /// No local default, no local validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local default.
    #[must_use]
    pub fn with_default(mut self, default: Rc<Value>) -> Self {
        self.default = Some(default);
        self
    }

    /// Set the local validator.
    #[must_use]
    pub fn with_assert(mut self, assert: AssertFn) -> Self {
        self.assert = Some(assert);
        self
    }
}

impl fmt::Debug for BindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindOptions")
            .field("default", &self.default)
            .field("assert", &self.assert.as_ref().map(|_| "Fn"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Slot internals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    notify: ChangeFn,
}

/// The creation-time local overrides, kept for re-resolution (external
/// changes, removal).
#[derive(Clone, Default)]
struct SlotSeed {
    local_default: Option<Rc<Value>>,
    local_assert: Option<AssertFn>,
}

struct WriterEntry {
    default: Option<Rc<Value>>,
    assert: Option<AssertFn>,
    writer: Writer,
}

struct SlotState {
    key: String,
    current: Rc<Value>,
    subscribers: Vec<Subscriber>,
    writers: Vec<WriterEntry>,
    seed: SlotSeed,
    idle_since: Option<Instant>,
}

fn same_default(a: &Option<Rc<Value>>, b: &Option<Rc<Value>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

fn same_assert(a: &Option<AssertFn>, b: &Option<AssertFn>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Writer — identity-stable write handle
// ---------------------------------------------------------------------------

/// Write handle for one key.
///
/// Obtained from [`Binding::writer`] or cached across binds with the same
/// identity parameters. Holds the store weakly: a writer that outlives its
/// store reports [`StoreError::Closed`] instead of resurrecting it.
#[derive(Clone)]
pub struct Writer {
    inner: Rc<WriterInner>,
}

struct WriterInner {
    key: String,
    registry: Weak<RegistryInner>,
}

impl Writer {
    /// The key this writer targets.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Replace the value. Persists, then notifies every subscriber of the
    /// key before returning.
    ///
    /// On a persistence failure the in-memory value is already updated and
    /// subscribers already notified when the error comes back; memory and
    /// disk diverge until a later successful write.
    pub fn set(&self, value: Value) -> Result<Rc<Value>, StoreError> {
        self.registry()?.write_value(&self.inner.key, value)
    }

    /// Compute the next value from the current one, then write it.
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) -> Result<Rc<Value>, StoreError> {
        self.registry()?.write_with(&self.inner.key, f)
    }

    /// Whether two handles are the same handle (pointer identity).
    #[must_use]
    pub fn same(a: &Writer, b: &Writer) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    fn registry(&self) -> Result<Rc<RegistryInner>, StoreError> {
        self.inner.registry.upgrade().ok_or(StoreError::Closed)
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").field("key", &self.inner.key).finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription + Binding
// ---------------------------------------------------------------------------

/// RAII guard for one subscriber. Dropping it unsubscribes; when the last
/// subscriber of a slot goes, the slot enters its idle grace period.
///
/// A subscription keeps its store alive (`Rc`), so a binding handed out
/// before the store handle went away keeps working until it is dropped.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    registry: Rc<RegistryInner>,
    key: String,
    id: SubscriberId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.key, self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

/// What a bind hands back: the value at bind time, a stable write handle,
/// and the subscription keeping the callback registered.
///
/// The value is a snapshot; later values arrive through the callback. The
/// snapshot handle is reference-stable: consumers clone the `Rc`, they never
/// mutate through it.
#[must_use = "dropping a Binding unsubscribes it"]
pub struct Binding {
    value: Rc<Value>,
    writer: Writer,
    subscription: Subscription,
}

impl Binding {
    /// The slot's value at bind time.
    #[must_use]
    pub fn value(&self) -> &Rc<Value> {
        &self.value
    }

    /// The identity-stable write handle for this key.
    #[must_use]
    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    /// Tear the binding down now. Equivalent to dropping it; idempotent by
    /// construction (consumes the binding).
    pub fn unbind(self) {}
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &self.subscription.key)
            .field("value", &self.value)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SlotRegistry
// ---------------------------------------------------------------------------

/// The engine: slot table, resolution pipeline, fan-out, deferred cleanup.
#[derive(Clone)]
pub struct SlotRegistry {
    inner: Rc<RegistryInner>,
}

struct RegistryInner {
    storage: PrefixedStorage,
    codec: Rc<dyn Codec>,
    schemas: RefCell<SchemaRegistry>,
    retain_idle: std::time::Duration,
    slots: RefCell<HashMap<String, Rc<RefCell<SlotState>>>>,
    pending: RefCell<VecDeque<ExternalChange>>,
    dispatch_depth: Cell<u32>,
    next_subscriber: Cell<u64>,
}

impl SlotRegistry {
    /// Build a registry from a consumed configuration.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let StoreConfig {
            key_prefix,
            storage,
            codec,
            schemas,
            retain_idle,
        } = config;

        let mut registry = SchemaRegistry::new();
        for schema in schemas {
            registry.add(schema);
        }

        Self {
            inner: Rc::new(RegistryInner {
                storage: PrefixedStorage::new(storage, key_prefix),
                codec,
                schemas: RefCell::new(registry),
                retain_idle,
                slots: RefCell::new(HashMap::new()),
                pending: RefCell::new(VecDeque::new()),
                dispatch_depth: Cell::new(0),
                next_subscriber: Cell::new(0),
            }),
        }
    }

    /// Subscribe `on_change` to `key`, creating the slot if absent.
    ///
    /// On creation the slot's value is resolved in order: persisted value
    /// passing the applicable validator → local default → schema default →
    /// null. When the slot already exists, the local default and validator
    /// do not re-seed it; they still participate in writer identity.
    pub fn bind(
        &self,
        key: &str,
        options: BindOptions,
        on_change: impl Fn(&Rc<Value>) + 'static,
    ) -> Binding {
        let notify: ChangeFn = Rc::new(on_change);
        self.inner.bind(key, options, notify)
    }

    /// Passive read: same resolution as a bind, but never grows the
    /// registry. Self-healing of a corrupt persisted entry still applies.
    #[must_use]
    pub fn read(&self, key: &str) -> Rc<Value> {
        self.inner.sweep();
        self.inner.current_or_resolve(key)
    }

    /// Write a value to `key`. See [`Writer::set`] for the contract.
    pub fn write(&self, key: &str, value: Value) -> Result<Rc<Value>, StoreError> {
        self.inner.write_value(key, value)
    }

    /// Write via an updater that receives the current value.
    pub fn write_with(
        &self,
        key: &str,
        f: impl FnOnce(&Value) -> Value,
    ) -> Result<Rc<Value>, StoreError> {
        self.inner.write_with(key, f)
    }

    /// Drop the persisted entry for `key` and reset its live slot (if any)
    /// to the resolved default, notifying subscribers.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }

    /// Append a schema. Existing slots are unaffected.
    pub fn register_schema(
        &self,
        matcher: impl Into<keyhold_core::KeyMatcher>,
        default: Value,
        assert: Option<AssertFn>,
    ) {
        self.inner.schemas.borrow_mut().register(matcher, default, assert);
    }

    /// Drain the backend's external-change events and apply them to live
    /// slots, notifying exactly as for a local write. Keys with no live slot
    /// are ignored. Call this once per host turn; events polled while a
    /// write is dispatching stay queued until the write completes.
    pub fn sync_external(&self) {
        self.inner.sync_external();
    }

    /// Number of live slots (after reclaiming expired idle ones).
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.inner.sweep();
        self.inner.slots.borrow().len()
    }
}

impl fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("slots", &self.inner.slots.borrow().len())
            .finish()
    }
}

impl RegistryInner {
    fn bind(self: &Rc<Self>, key: &str, options: BindOptions, notify: ChangeFn) -> Binding {
        self.sweep();
        let slot = self.slot_for(key, &options);
        let id = self.next_subscriber_id();

        let value = {
            let mut state = slot.borrow_mut();
            state.idle_since = None;
            state.subscribers.push(Subscriber { id, notify });
            Rc::clone(&state.current)
        };

        let writer = self.writer_for(&slot, key, &options);
        Binding {
            value,
            writer,
            subscription: Subscription {
                registry: Rc::clone(self),
                key: key.to_string(),
                id,
            },
        }
    }

    /// Get the live slot for `key`, or create one seeded via resolution.
    fn slot_for(&self, key: &str, options: &BindOptions) -> Rc<RefCell<SlotState>> {
        if let Some(slot) = self.slots.borrow().get(key) {
            return Rc::clone(slot);
        }

        let seed = SlotSeed {
            local_default: options.default.clone(),
            local_assert: options.assert.clone(),
        };
        let current = self.resolve(key, &seed);
        let slot = Rc::new(RefCell::new(SlotState {
            key: key.to_string(),
            current,
            subscribers: Vec::new(),
            writers: Vec::new(),
            seed,
            idle_since: None,
        }));
        // Resolution runs user validators, which may re-enter and bind this
        // key themselves; the slot that made it into the table wins.
        let mut slots = self.slots.borrow_mut();
        if let Some(existing) = slots.get(key) {
            return Rc::clone(existing);
        }
        tracing::debug!(key = %key, "slot created");
        slots.insert(key.to_string(), Rc::clone(&slot));
        slot
    }

    fn writer_for(
        self: &Rc<Self>,
        slot: &Rc<RefCell<SlotState>>,
        key: &str,
        options: &BindOptions,
    ) -> Writer {
        let mut state = slot.borrow_mut();
        for entry in &state.writers {
            if same_default(&entry.default, &options.default)
                && same_assert(&entry.assert, &options.assert)
            {
                return entry.writer.clone();
            }
        }

        let writer = Writer {
            inner: Rc::new(WriterInner {
                key: key.to_string(),
                registry: Rc::downgrade(self),
            }),
        };
        state.writers.push(WriterEntry {
            default: options.default.clone(),
            assert: options.assert.clone(),
            writer: writer.clone(),
        });
        writer
    }

    fn next_subscriber_id(&self) -> SubscriberId {
        let id = self.next_subscriber.get();
        self.next_subscriber.set(id + 1);
        SubscriberId(id)
    }

    // -- resolution ---------------------------------------------------------

    /// Resolve the value for `key`: persisted (validated) → local default →
    /// schema default → null. A persisted entry that fails to decode or is
    /// rejected by the validator is overwritten with the resolved fallback.
    fn resolve(&self, key: &str, seed: &SlotSeed) -> Rc<Value> {
        let raw = match self.storage.get(key) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "storage read failed; falling back");
                None
            }
        };
        self.resolve_raw(key, raw.as_deref(), seed)
    }

    fn resolve_raw(&self, key: &str, raw: Option<&str>, seed: &SlotSeed) -> Rc<Value> {
        let (schema_default, schema_assert) = self.schema_for(key);
        let assert = seed.local_assert.clone().or(schema_assert);

        let mut heal = false;
        if let Some(raw) = raw {
            match self.codec.decode(raw) {
                Ok(value) if assert.as_ref().is_none_or(|a| a(&value)) => {
                    return Rc::new(value);
                }
                Ok(_) => {
                    tracing::warn!(key = %key, "persisted value rejected by validator; falling back");
                    heal = true;
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "persisted value failed to decode; falling back");
                    heal = true;
                }
            }
        }

        let fallback = seed
            .local_default
            .as_deref()
            .cloned()
            .or(schema_default)
            .unwrap_or(Value::Null);
        if heal {
            self.overwrite(key, &fallback);
        }
        Rc::new(fallback)
    }

    /// Replace a rejected persisted entry with the fallback, best-effort.
    fn overwrite(&self, key: &str, value: &Value) {
        match self.codec.encode(value) {
            Ok(raw) => {
                if let Err(err) = self.storage.set(key, &raw) {
                    tracing::warn!(key = %key, error = %err, "could not overwrite rejected entry");
                }
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "could not encode fallback for overwrite");
            }
        }
    }

    fn schema_for(&self, key: &str) -> (Option<Value>, Option<AssertFn>) {
        let schemas = self.schemas.borrow();
        match schemas.resolve(key) {
            Some(schema) => (Some(schema.default.clone()), schema.assert.clone()),
            None => (None, None),
        }
    }

    fn current_or_resolve(&self, key: &str) -> Rc<Value> {
        if let Some(slot) = self.slots.borrow().get(key) {
            return Rc::clone(&slot.borrow().current);
        }
        self.resolve(key, &SlotSeed::default())
    }

    // -- writes -------------------------------------------------------------

    fn write_value(&self, key: &str, next: Value) -> Result<Rc<Value>, StoreError> {
        self.sweep();
        let next = Rc::new(next);
        let slot = { self.slots.borrow().get(key).cloned() };

        match slot {
            Some(slot) => {
                slot.borrow_mut().current = Rc::clone(&next);
                let persisted = self.persist(key, &next);
                self.notify(&slot, &next);
                self.drain_pending();
                persisted.map(|()| next)
            }
            // No live slot: persist only, nobody to notify.
            None => self.persist(key, &next).map(|()| next),
        }
    }

    fn write_with(
        &self,
        key: &str,
        f: impl FnOnce(&Value) -> Value,
    ) -> Result<Rc<Value>, StoreError> {
        let prev = self.current_or_resolve(key);
        let next = f(&prev);
        self.write_value(key, next)
    }

    fn persist(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let raw = self.codec.encode(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.storage
            .set(key, &raw)
            .map_err(|source| StoreError::Persistence {
                key: key.to_string(),
                source,
            })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.sweep();
        self.storage
            .remove(key)
            .map_err(|source| StoreError::Persistence {
                key: key.to_string(),
                source,
            })?;

        let slot = { self.slots.borrow().get(key).cloned() };
        if let Some(slot) = slot {
            let next = {
                let state = slot.borrow();
                self.resolve_raw(key, None, &state.seed)
            };
            slot.borrow_mut().current = Rc::clone(&next);
            self.notify(&slot, &next);
            self.drain_pending();
        }
        Ok(())
    }

    // -- fan-out ------------------------------------------------------------

    /// Invoke every subscriber of the slot with the new value, in
    /// registration order. The subscriber list is snapshotted first, so a
    /// callback unsubscribing (or binding) mid-dispatch takes effect on the
    /// next cycle, and no `RefCell` borrow is held while callbacks run.
    fn notify(&self, slot: &Rc<RefCell<SlotState>>, value: &Rc<Value>) {
        let callbacks: Vec<ChangeFn> = {
            let state = slot.borrow();
            tracing::trace!(
                key = %state.key,
                subscribers = state.subscribers.len(),
                "fan-out"
            );
            state.subscribers.iter().map(|s| Rc::clone(&s.notify)).collect()
        };

        self.dispatch_depth.set(self.dispatch_depth.get() + 1);
        for callback in callbacks {
            callback(value);
        }
        self.dispatch_depth.set(self.dispatch_depth.get() - 1);
    }

    fn unsubscribe(&self, key: &str, id: SubscriberId) {
        let slot = { self.slots.borrow().get(key).cloned() };
        let Some(slot) = slot else { return };

        let mut state = slot.borrow_mut();
        state.subscribers.retain(|s| s.id != id);
        if state.subscribers.is_empty() && state.idle_since.is_none() {
            state.idle_since = Some(Instant::now());
            tracing::debug!(key = %key, "slot idle; reclaim deferred");
        }
    }

    /// Reclaim slots whose grace period expired.
    fn sweep(&self) {
        let retain_idle = self.retain_idle;
        let now = Instant::now();
        self.slots.borrow_mut().retain(|key, slot| {
            let state = slot.borrow();
            let expired = state.subscribers.is_empty()
                && state
                    .idle_since
                    .is_some_and(|since| now.duration_since(since) >= retain_idle);
            if expired {
                tracing::debug!(key = %key, "idle slot reclaimed");
            }
            !expired
        });
    }

    // -- external changes ---------------------------------------------------

    fn sync_external(&self) {
        self.sweep();
        let events = self.storage.poll_external();
        if !events.is_empty() {
            self.pending.borrow_mut().extend(events);
        }
        self.drain_pending();
    }

    /// Apply queued external events, unless a dispatch is on the stack (the
    /// write that is dispatching drains the queue when it completes).
    fn drain_pending(&self) {
        if self.dispatch_depth.get() != 0 {
            return;
        }
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(change) = next else { break };
            self.apply_external(change);
        }
    }

    fn apply_external(&self, change: ExternalChange) {
        let slot = { self.slots.borrow().get(&change.key).cloned() };
        let Some(slot) = slot else {
            tracing::trace!(key = %change.key, "external change for unbound key ignored");
            return;
        };

        let next = {
            let state = slot.borrow();
            self.resolve_raw(&change.key, change.value.as_deref(), &state.seed)
        };
        slot.borrow_mut().current = Rc::clone(&next);
        tracing::debug!(key = %change.key, "external change applied");
        self.notify(&slot, &next);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
