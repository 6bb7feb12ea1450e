//! Key-value store protocol for the catalog data layer.
//!
//! The repository layer treats the store as an external collaborator. This
//! crate pins down the interface it relies on and ships one backend.
//!
//! # Protocol
//!
//! All backends implement the [`KvStore`] trait:
//!
//! - single-key string get/set/delete, plus pipelined `mget`
//! - list range reads and hash field reads (`hget`, `hmget`, `hkeys`)
//! - cursor-driven keyspace (`scan`) and hash (`hscan`) iteration with
//!   glob `MATCH` patterns
//! - [`Transaction`]: guarded multi-command execution, all-or-nothing
//!
//! # Storage Backends
//!
//! - [`InMemoryKvStore`] -- `BTreeMap`-based store for tests, embedding, and
//!   JSON snapshot files
//!
//! # Design Rules
//!
//! 1. Writes that must land together go through one [`Transaction`].
//! 2. Guards are checked in the same atomic step as the commands they
//!    protect; a failed guard applies nothing.
//! 3. The store never interprets values.
//! 4. All backend errors are propagated, never silently ignored.

pub mod command;
pub mod error;
pub mod glob;
pub mod memory;
pub mod traits;

pub use command::{Command, Guard, Reply, ScanPage, Transaction, TxOutcome};
pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryKvStore, Snapshot, StoredValue};
pub use traits::KvStore;
