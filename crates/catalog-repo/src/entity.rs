//! Opaque entity bodies and index value normalization.
//!
//! Entities are schema-free JSON objects. The repository only looks at the
//! id property and the configured index properties; validating a domain
//! shape is the caller's job.

use serde_json::{Map, Value};

use crate::error::{RepoError, RepoResult};

/// A stored document: property name to JSON value.
pub type Entity = Map<String, Value>;

/// Something that names an entity: a bare id or the entity itself.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityRef {
    Id(String),
    Entity(Entity),
}

impl From<&str> for EntityRef {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<String> for EntityRef {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

impl From<&String> for EntityRef {
    fn from(id: &String) -> Self {
        Self::Id(id.clone())
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl From<&Entity> for EntityRef {
    fn from(entity: &Entity) -> Self {
        Self::Entity(entity.clone())
    }
}

impl EntityRef {
    /// Extract the id, reading `id_property` from an entity.
    pub fn id(&self, id_property: &str) -> RepoResult<String> {
        match self {
            Self::Id(id) => Ok(id.clone()),
            Self::Entity(entity) => entity_id(entity, id_property)?
                .map(str::to_string)
                .ok_or_else(|| RepoError::invalid(format!("entity has no {id_property} property"))),
        }
    }
}

/// Read the id property of an entity.
///
/// Returns `Ok(None)` when the property is absent or null, and
/// `InvalidRequest` when it holds anything other than a string.
pub fn entity_id<'a>(entity: &'a Entity, id_property: &str) -> RepoResult<Option<&'a str>> {
    match entity.get(id_property) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(other) => Err(RepoError::invalid(format!(
            "{id_property} must be a string, found {other}"
        ))),
    }
}

/// Normalize free text: trim, lowercase, and collapse whitespace runs.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize an index property value.
///
/// Returns `Ok(None)` for an empty value: missing, null, or a string that
/// normalizes to nothing. Arrays and objects cannot be indexed.
pub fn normalize_value(property: &str, value: Option<&Value>) -> RepoResult<Option<String>> {
    let text = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => normalize_text(s),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Array(_) | Value::Object(_)) => {
            return Err(RepoError::invalid(format!(
                "indexed property {property} must hold a scalar value"
            )))
        }
    };
    Ok(if text.is_empty() { None } else { Some(text) })
}

/// Decode a stored body, checking that it is an object carrying `id`.
pub(crate) fn decode_body(key: &str, raw: &str, id_property: &str, id: &str) -> RepoResult<Entity> {
    let value: Value = serde_json::from_str(raw).map_err(|e| RepoError::CorruptEntity {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    let Value::Object(entity) = value else {
        return Err(RepoError::CorruptEntity {
            key: key.to_string(),
            reason: "body is not a JSON object".into(),
        });
    };
    match entity_id(&entity, id_property) {
        Ok(Some(stored)) if stored == id => Ok(entity),
        _ => Err(RepoError::CorruptEntity {
            key: key.to_string(),
            reason: format!("body does not carry {id_property}={id}"),
        }),
    }
}

/// Encode a body for storage.
pub(crate) fn encode_body(entity: &Entity) -> String {
    Value::Object(entity.clone()).to_string()
}
