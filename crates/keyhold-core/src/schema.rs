#![forbid(unsafe_code)]

//! Key schemas: default values and validators resolved per key.
//!
//! A [`Schema`] pairs a [`KeyMatcher`] with a default value and an optional
//! validator. The [`SchemaRegistry`] holds schemas in registration order and
//! resolves the applicable one for any concrete key.
//!
//! # Invariants
//!
//! 1. Exact-string matchers are checked before pattern matchers.
//! 2. Within each matcher class, registration order decides; first hit wins.
//! 3. The registry is append-only: schemas are never removed or replaced.
//!
//! # Failure Modes
//!
//! - No schema matches a key: [`SchemaRegistry::resolve`] returns `None`
//!   (the engine then falls through to its null-equivalent).

use std::fmt;
use std::rc::Rc;

pub use regex::Regex;

use crate::Value;

/// Validator run against a candidate value for a key.
///
/// Validators are shared `Rc` closures: the engine compares them by pointer
/// identity when deciding whether two binds asked for the same validator, so
/// callers must reuse one `Rc` rather than re-wrapping the closure per call.
pub type AssertFn = Rc<dyn Fn(&Value) -> bool>;

/// Polymorphic key matcher: a literal key or a regular-expression pattern.
#[derive(Debug, Clone)]
pub enum KeyMatcher {
    /// Matches exactly one key.
    Exact(String),
    /// Matches any key the pattern finds a match in (unanchored, like
    /// `Regex::is_match`). Anchor with `^`/`$` for whole-key matching.
    Pattern(Regex),
}

impl KeyMatcher {
    /// Matcher for exactly one key.
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    /// Matcher from a regular-expression source string.
    pub fn pattern(source: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(Regex::new(source)?))
    }

    /// Whether this matcher applies to `key`.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Pattern(re) => re.is_match(key),
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

impl From<&str> for KeyMatcher {
    fn from(key: &str) -> Self {
        Self::Exact(key.to_string())
    }
}

impl From<String> for KeyMatcher {
    fn from(key: String) -> Self {
        Self::Exact(key)
    }
}

impl From<Regex> for KeyMatcher {
    fn from(re: Regex) -> Self {
        Self::Pattern(re)
    }
}

/// A registered (matcher, default, validator) triple.
#[derive(Clone)]
pub struct Schema {
    /// Which keys this schema applies to.
    pub matcher: KeyMatcher,
    /// Seed value for keys with nothing usable in storage.
    pub default: Value,
    /// Optional validator for persisted values. `None` accepts everything.
    pub assert: Option<AssertFn>,
}

impl Schema {
    /// Build a schema.
    pub fn new(matcher: impl Into<KeyMatcher>, default: Value, assert: Option<AssertFn>) -> Self {
        Self {
            matcher: matcher.into(),
            default,
            assert,
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("matcher", &self.matcher)
            .field("default", &self.default)
            .field("assert", &self.assert.as_ref().map(|_| "Fn"))
            .finish()
    }
}

/// Ordered, append-only collection of schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: Vec<Schema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Registration order is resolution order.
    pub fn register(
        &mut self,
        matcher: impl Into<KeyMatcher>,
        default: Value,
        assert: Option<AssertFn>,
    ) {
        self.entries.push(Schema::new(matcher, default, assert));
    }

    /// Append an already-built schema.
    pub fn add(&mut self, schema: Schema) {
        self.entries.push(schema);
    }

    /// Resolve the applicable schema for `key`.
    ///
    /// The first exact match in registration order wins outright; otherwise
    /// the first pattern match wins; otherwise `None`.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<&Schema> {
        self.entries
            .iter()
            .find(|s| s.matcher.is_exact() && s.matcher.matches(key))
            .or_else(|| self.entries.iter().find(|s| s.matcher.matches(key)))
    }

    /// Number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
