//! Key layout for one namespaced collection.
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `{ns}{id}` | string | entity body (JSON) |
//! | `{ns}~order` | list | ordering list |
//! | `{ns}~u:{prop}` | hash | unique index, normalized value to id |
//! | `{ns}~m:{prop}:{id}` | string | non-unique marker, normalized value |
//! | `~registry:{id}` | hash | one field per namespace owning `id` |
//!
//! Everything under `{ns}~` is derived state; every other key under `{ns}`
//! is an entity body.

use catalog_store::glob;

use crate::error::{RepoError, RepoResult};

/// Marker separating derived keys from entity bodies.
pub const DERIVED_MARKER: char = '~';

/// Prefix of the store-wide id registry.
pub const REGISTRY_PREFIX: &str = "~registry:";

/// What a key under a namespace holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind<'a> {
    /// Entity body with the given id.
    Body(&'a str),
    /// Derived index or ordering state.
    Derived,
    /// The key does not belong to this namespace.
    Foreign,
}

/// Pure key builder for one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: String,
}

impl KeyCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn body(&self, id: &str) -> String {
        format!("{}{id}", self.namespace)
    }

    pub fn order(&self) -> String {
        format!("{}{DERIVED_MARKER}order", self.namespace)
    }

    pub fn unique_index(&self, property: &str) -> String {
        format!("{}{DERIVED_MARKER}u:{property}", self.namespace)
    }

    pub fn marker(&self, property: &str, id: &str) -> String {
        format!("{}{DERIVED_MARKER}m:{property}:{id}", self.namespace)
    }

    /// Scan pattern matching every marker of one non-unique property.
    pub fn marker_pattern(&self, property: &str) -> String {
        format!("{}:*", glob::escape(&self.marker_prefix(property)))
    }

    /// Recover the id from a marker key of `property`.
    pub fn marker_id<'k>(&self, property: &str, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(&self.marker_prefix(property))?
            .strip_prefix(':')
    }

    /// Scan pattern matching every key of this namespace.
    pub fn namespace_pattern(&self) -> String {
        format!("{}*", glob::escape(&self.namespace))
    }

    /// Classify a key found while scanning the namespace.
    pub fn classify<'k>(&self, key: &'k str) -> KeyKind<'k> {
        match key.strip_prefix(self.namespace.as_str()) {
            None | Some("") => KeyKind::Foreign,
            Some(rest) if rest.starts_with(DERIVED_MARKER) => KeyKind::Derived,
            Some(id) => KeyKind::Body(id),
        }
    }

    fn marker_prefix(&self, property: &str) -> String {
        format!("{}{DERIVED_MARKER}m:{property}", self.namespace)
    }
}

/// Registry hash for a bare id.
pub fn registry(id: &str) -> String {
    format!("{REGISTRY_PREFIX}{id}")
}

/// Scan pattern matching every registry key.
pub fn registry_pattern() -> String {
    format!("{}*", glob::escape(REGISTRY_PREFIX))
}

/// Recover the id from a registry key.
pub fn registry_id(key: &str) -> Option<&str> {
    key.strip_prefix(REGISTRY_PREFIX)
}

/// Substring pattern for a normalized search query.
pub fn contains_pattern(query: &str) -> String {
    format!("*{}*", glob::escape(query))
}

pub fn validate_namespace(namespace: &str) -> RepoResult<()> {
    if namespace.is_empty() {
        return Err(RepoError::invalid("namespace must not be empty"));
    }
    if namespace.starts_with(DERIVED_MARKER) {
        return Err(RepoError::invalid(format!(
            "namespace {namespace:?} must not start with '{DERIVED_MARKER}'"
        )));
    }
    if glob::has_meta(namespace) {
        return Err(RepoError::invalid(format!(
            "namespace {namespace:?} contains a pattern character"
        )));
    }
    Ok(())
}

pub fn validate_property(property: &str) -> RepoResult<()> {
    if property.is_empty() {
        return Err(RepoError::invalid("index property must not be empty"));
    }
    if property.contains([':', DERIVED_MARKER]) || glob::has_meta(property) {
        return Err(RepoError::invalid(format!(
            "index property {property:?} contains a reserved character"
        )));
    }
    Ok(())
}

pub fn validate_id(id: &str) -> RepoResult<()> {
    if id.is_empty() {
        return Err(RepoError::invalid("id must not be empty"));
    }
    if id.starts_with(DERIVED_MARKER) {
        return Err(RepoError::invalid(format!(
            "id {id:?} must not start with '{DERIVED_MARKER}'"
        )));
    }
    if glob::has_meta(id) {
        return Err(RepoError::invalid(format!("id {id:?} contains a pattern character")));
    }
    Ok(())
}
