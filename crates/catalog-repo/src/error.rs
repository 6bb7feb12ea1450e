//! Error types for the repository crate.

use std::fmt;

/// One reason an `AlreadyExists` error was raised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Conflict {
    /// An entity with this id is already stored.
    Id(String),
    /// A unique index value is already held by another entity.
    Value { property: String, value: String },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Value { property, value } => write!(f, "{property}={value:?}"),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur during repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// One or more requested ids are not stored.
    #[error("not found: {}", .ids.join(", "))]
    NotFound { ids: Vec<String> },

    /// An id or unique index value is already taken.
    #[error("already exists: {}", join(.conflicts))]
    AlreadyExists { conflicts: Vec<Conflict> },

    /// The request or configuration is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A bare id resolved into more than one namespace.
    #[error("ID collision detected: {id} exists in {}", .namespaces.join(", "))]
    Collision { id: String, namespaces: Vec<String> },

    /// A key read during the read phase changed before the write committed.
    /// Nothing was written; the call may be retried.
    #[error("concurrent modification of {key}, retry")]
    Contended { key: String },

    /// A stored body could not be decoded as an entity.
    #[error("corrupt entity at {key}: {reason}")]
    CorruptEntity { key: String, reason: String },

    /// Store round-trip failed.
    #[error("store error: {0}")]
    Store(#[from] catalog_store::StoreError),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    pub fn not_found(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::NotFound {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }
}

/// Convenience alias for repository results.
pub type RepoResult<T> = Result<T, RepoError>;
