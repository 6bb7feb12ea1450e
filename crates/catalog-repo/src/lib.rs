//! Document repository for the catalog.
//!
//! Stores schema-free JSON entities in namespaced collections on top of a
//! [`catalog_store::KvStore`], keeps secondary indexes and a per-collection
//! ordering list in step with every write, and routes bare ids across
//! collections through a store-wide registry.
//!
//! # Key Types
//!
//! - [`CollectionRepository`] -- CRUD, ordering, search, and index rebuild
//!   for one namespace
//! - [`Federation`] -- id-routed operations over every configured collection
//! - [`CatalogConfig`] / [`CollectionConfig`] -- immutable configuration
//! - [`IndexManager`] -- index maintenance across entity transitions

pub mod collection;
pub mod config;
pub mod entity;
pub mod error;
pub mod federation;
pub mod index;
pub mod keys;
pub mod ordering;
pub mod scan;

pub use collection::{CollectionRepository, Filters, RebuildReport};
pub use config::{CatalogConfig, CollectionConfig, IndexSpec};
pub use entity::{normalize_text, normalize_value, Entity, EntityRef};
pub use error::{Conflict, RepoError, RepoResult};
pub use federation::Federation;
pub use index::{Claim, IndexDelta, IndexManager};
pub use keys::KeyCodec;
pub use ordering::reorder;
