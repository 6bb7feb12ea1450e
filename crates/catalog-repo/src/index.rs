//! Secondary index maintenance.
//!
//! The [`IndexManager`] turns an entity transition (old body to new body)
//! into the index commands that keep derived state in step. The same table
//! is applied on create (old absent), update, delete (new absent), and
//! rebuild (old absent):
//!
//! | old | new | action |
//! |-----|-----|--------|
//! | v | v | nothing |
//! | v | w | remove v, write w |
//! | v | empty | remove v (rejected if the index is not nullable) |
//! | empty | w | write w |
//!
//! Unique indexes live in one hash per property (value to id); non-unique
//! indexes keep one marker key per entity (value stored under the id).

use std::collections::BTreeMap;

use catalog_store::Command;

use crate::config::IndexSpec;
use crate::entity::{normalize_value, Entity};
use crate::error::{RepoError, RepoResult};
use crate::keys::KeyCodec;

/// A normalized value of a unique index property.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Claim {
    pub property: String,
    pub value: String,
}

/// Index commands produced by one transition.
///
/// Removals are kept apart from writes so a batch can issue every removal
/// before any write; that lets two entities of one batch swap unique values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexDelta {
    pub removals: Vec<Command>,
    pub writes: Vec<Command>,
    /// Unique values the entity takes.
    pub claims: Vec<Claim>,
    /// Unique values the entity gives up.
    pub releases: Vec<Claim>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.writes.is_empty()
    }
}

/// Computes index maintenance for one collection.
#[derive(Clone, Debug)]
pub struct IndexManager {
    codec: KeyCodec,
    indexes: BTreeMap<String, IndexSpec>,
}

impl IndexManager {
    pub fn new(codec: KeyCodec, indexes: BTreeMap<String, IndexSpec>) -> Self {
        Self { codec, indexes }
    }

    pub fn spec(&self, property: &str) -> Option<&IndexSpec> {
        self.indexes.get(property)
    }

    /// Compute the index commands taking entity `id` from `old` to `new`.
    pub fn transition(&self, id: &str, old: Option<&Entity>, new: Option<&Entity>) -> RepoResult<IndexDelta> {
        let mut delta = IndexDelta::default();

        for (property, spec) in &self.indexes {
            // An old body that cannot be normalized never had an entry.
            let old_value = old.and_then(|e| normalize_value(property, e.get(property)).ok().flatten());
            let new_value = match new {
                Some(e) => normalize_value(property, e.get(property))?,
                None => None,
            };

            if new.is_some() && new_value.is_none() && !spec.nullable {
                return Err(RepoError::invalid(format!(
                    "{property} is required on {id}"
                )));
            }
            if old_value == new_value {
                continue;
            }

            if let Some(value) = old_value {
                if spec.unique {
                    delta
                        .removals
                        .push(Command::hdel(self.codec.unique_index(property), value.clone()));
                    delta.releases.push(Claim {
                        property: property.clone(),
                        value,
                    });
                } else {
                    delta.removals.push(Command::del(self.codec.marker(property, id)));
                }
            }

            if let Some(value) = new_value {
                if spec.unique {
                    delta.writes.push(Command::hset(
                        self.codec.unique_index(property),
                        value.clone(),
                        id,
                    ));
                    delta.claims.push(Claim {
                        property: property.clone(),
                        value,
                    });
                } else {
                    delta.writes.push(Command::set(self.codec.marker(property, id), value));
                }
            }
        }

        Ok(delta)
    }
}
