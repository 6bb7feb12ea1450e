use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, RepoResult};
use crate::keys::{validate_namespace, validate_property};

/// Default name of the id property.
pub const DEFAULT_ID_PROPERTY: &str = "_id";

/// Default number of keys examined per scan round-trip.
pub const DEFAULT_SCAN_BATCH: usize = 256;

/// Indexing rules for one property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// At most one entity may hold a given normalized value.
    #[serde(default)]
    pub unique: bool,
    /// The property may be missing or empty.
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl Default for IndexSpec {
    fn default() -> Self {
        Self {
            unique: false,
            nullable: true,
        }
    }
}

impl IndexSpec {
    /// Unique and required.
    pub fn unique() -> Self {
        Self {
            unique: true,
            nullable: false,
        }
    }

    /// Non-unique and optional.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_id_property() -> String {
    DEFAULT_ID_PROPERTY.to_string()
}

fn default_scan_batch() -> usize {
    DEFAULT_SCAN_BATCH
}

/// Configuration of one namespaced collection.
///
/// Immutable for the lifetime of the repository built from it; a schema
/// change means a fresh repository followed by an index rebuild.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Key prefix of the collection, e.g. `"movies:"`.
    pub namespace: String,
    #[serde(default = "default_id_property")]
    pub id_property: String,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexSpec>,
    /// Keys examined per scan round-trip.
    #[serde(default = "default_scan_batch")]
    pub scan_batch: usize,
}

impl CollectionConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id_property: default_id_property(),
            indexes: BTreeMap::new(),
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    pub fn with_id_property(mut self, id_property: impl Into<String>) -> Self {
        self.id_property = id_property.into();
        self
    }

    pub fn with_index(mut self, property: impl Into<String>, spec: IndexSpec) -> Self {
        self.indexes.insert(property.into(), spec);
        self
    }

    pub fn with_scan_batch(mut self, scan_batch: usize) -> Self {
        self.scan_batch = scan_batch;
        self
    }

    pub fn validate(&self) -> RepoResult<()> {
        validate_namespace(&self.namespace)?;
        if self.id_property.is_empty() {
            return Err(RepoError::invalid(format!(
                "{}: id property must not be empty",
                self.namespace
            )));
        }
        if self.scan_batch == 0 {
            return Err(RepoError::invalid(format!(
                "{}: scan_batch must be positive",
                self.namespace
            )));
        }
        for property in self.indexes.keys() {
            validate_property(property)?;
            if *property == self.id_property {
                return Err(RepoError::invalid(format!(
                    "{}: the id property {property} is indexed implicitly",
                    self.namespace
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of every collection served by one federation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

impl CatalogConfig {
    pub fn new(collections: Vec<CollectionConfig>) -> Self {
        Self { collections }
    }

    /// Parse and validate a TOML configuration document.
    pub fn from_toml_str(source: &str) -> RepoResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| RepoError::invalid(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> RepoResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Validate every collection and their namespaces against each other.
    ///
    /// No namespace may be a prefix of another: `movies:` and `movies:x`
    /// would both claim the body key `movies:x1`.
    pub fn validate(&self) -> RepoResult<()> {
        let mut seen = HashSet::new();
        for collection in &self.collections {
            collection.validate()?;
            if !seen.insert(collection.namespace.as_str()) {
                return Err(RepoError::invalid(format!(
                    "duplicate namespace {}",
                    collection.namespace
                )));
            }
        }
        for a in &self.collections {
            for b in &self.collections {
                if a.namespace != b.namespace && b.namespace.starts_with(&a.namespace) {
                    return Err(RepoError::invalid(format!(
                        "namespace {} is a prefix of {}",
                        a.namespace, b.namespace
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[collections]]
        namespace = "categories:"
        [collections.indexes.name]
        unique = true
        nullable = false

        [[collections]]
        namespace = "movies:"
        id_property = "id"
        scan_batch = 64
        [collections.indexes.title]
        unique = true
        [collections.indexes.genre]
    "#;

    #[test]
    fn parse_sample() {
        let config = CatalogConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.collections.len(), 2);

        let categories = &config.collections[0];
        assert_eq!(categories.id_property, "_id");
        assert_eq!(categories.scan_batch, DEFAULT_SCAN_BATCH);
        assert_eq!(categories.indexes["name"], IndexSpec::unique());

        let movies = &config.collections[1];
        assert_eq!(movies.id_property, "id");
        assert_eq!(movies.scan_batch, 64);
        assert_eq!(movies.indexes["title"], IndexSpec { unique: true, nullable: true });
        assert_eq!(movies.indexes["genre"], IndexSpec::plain());
    }

    #[test]
    fn malformed_toml_is_invalid_request() {
        let err = CatalogConfig::from_toml_str("collections = 3").unwrap_err();
        assert!(matches!(err, RepoError::InvalidRequest(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = CatalogConfig::load(&path).unwrap();
        assert_eq!(config.collections[1].namespace, "movies:");
    }

    #[test]
    fn id_property_cannot_be_indexed() {
        let config = CollectionConfig::new("movies:").with_index("_id", IndexSpec::unique());
        assert!(matches!(config.validate(), Err(RepoError::InvalidRequest(_))));
    }

    #[test]
    fn rejects_duplicate_and_overlapping_namespaces() {
        let dup = CatalogConfig::new(vec![
            CollectionConfig::new("movies:"),
            CollectionConfig::new("movies:"),
        ]);
        assert!(dup.validate().is_err());

        let overlap = CatalogConfig::new(vec![
            CollectionConfig::new("movies:"),
            CollectionConfig::new("movies:extras:"),
        ]);
        assert!(overlap.validate().is_err());

        let fine = CatalogConfig::new(vec![
            CollectionConfig::new("movies:"),
            CollectionConfig::new("shows:"),
        ]);
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn spec_builders() {
        assert!(!IndexSpec::unique().nullable);
        assert!(IndexSpec::unique().optional().nullable);
        assert!(!IndexSpec::plain().required().nullable);
    }
}
