//! Commands, guards, and transactions for the atomic write primitive.
//!
//! A [`Transaction`] is the unit handed to [`KvStore::exec`]. The store checks
//! every [`Guard`] and applies every [`Command`] as one indivisible step:
//! either all guards hold and all commands apply, or nothing changes.
//!
//! [`KvStore::exec`]: crate::KvStore::exec

use serde::{Deserialize, Serialize};

/// A single mutating command queued inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set a string key, replacing any previous value.
    Set { key: String, value: String },
    /// Delete a key of any type. Replies with the number of keys removed.
    Del { key: String },
    /// Append values to the tail of a list. Replies with the new length.
    RPush { key: String, values: Vec<String> },
    /// Remove occurrences of `value` from a list. `count == 0` removes all.
    /// Replies with the number of removed elements.
    LRem { key: String, count: i64, value: String },
    /// Set a hash field. Replies with 1 if the field is new, 0 if replaced.
    HSet {
        key: String,
        field: String,
        value: String,
    },
    /// Delete a hash field. Replies with the number of fields removed.
    HDel { key: String, field: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn rpush(key: impl Into<String>, values: Vec<String>) -> Self {
        Self::RPush {
            key: key.into(),
            values,
        }
    }

    pub fn lrem_all(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::LRem {
            key: key.into(),
            count: 0,
            value: value.into(),
        }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::HDel {
            key: key.into(),
            field: field.into(),
        }
    }

    /// The key this command touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Del { key }
            | Self::RPush { key, .. }
            | Self::LRem { key, .. }
            | Self::HSet { key, .. }
            | Self::HDel { key, .. } => key,
        }
    }
}

/// Reply to one command of a committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Integer(i64),
}

impl Reply {
    /// Integer payload, or 0 for `Ok`.
    pub fn as_int(&self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Integer(n) => *n,
        }
    }
}

/// A precondition evaluated atomically with the transaction's commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    /// The key must not exist.
    KeyAbsent { key: String },
    /// The key must exist.
    KeyPresent { key: String },
    /// The hash field must be absent, or hold one of `owners`.
    FieldFree {
        key: String,
        field: String,
        owners: Vec<String>,
    },
    /// The string key must hold exactly `value`.
    ValueEquals { key: String, value: String },
    /// The list must hold exactly `values`; a missing key equals an empty list.
    ListEquals { key: String, values: Vec<String> },
}

impl Guard {
    pub fn key_absent(key: impl Into<String>) -> Self {
        Self::KeyAbsent { key: key.into() }
    }

    pub fn key_present(key: impl Into<String>) -> Self {
        Self::KeyPresent { key: key.into() }
    }

    pub fn field_free(key: impl Into<String>, field: impl Into<String>, owners: Vec<String>) -> Self {
        Self::FieldFree {
            key: key.into(),
            field: field.into(),
            owners,
        }
    }

    pub fn value_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::ValueEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn list_equals(key: impl Into<String>, values: Vec<String>) -> Self {
        Self::ListEquals {
            key: key.into(),
            values,
        }
    }
}

/// A batch of guards and commands executed as one unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    pub guards: Vec<Guard>,
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&mut self, guard: Guard) -> &mut Self {
        self.guards.push(guard);
        self
    }

    /// Queue a command and return its position in the reply vector.
    pub fn push(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn extend(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty() && self.commands.is_empty()
    }
}

/// Result of executing a [`Transaction`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// All guards held. One reply per command, in queue order.
    Committed(Vec<Reply>),
    /// The guard at this index failed; nothing was applied.
    Aborted { guard: usize },
}

/// One page of a cursor-driven scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPage<T> {
    /// Cursor for the next call; `0` once iteration is complete.
    pub cursor: u64,
    pub items: Vec<T>,
}
