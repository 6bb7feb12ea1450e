//! One repository over every configured collection.
//!
//! Bare ids are routed through the `~registry:{id}` hash each collection
//! maintains alongside its bodies. An id owned by more than one namespace
//! is a fatal [`RepoError::Collision`]; nothing is written once any id of
//! a batch fails to resolve. Batches spanning several collections are
//! validated per collection and then committed as one transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use catalog_store::{KvStore, StoreResult};
use futures::future::try_join_all;

use crate::collection::{CollectionRepository, Filters, PreparedWrite, RebuildReport};
use crate::config::CatalogConfig;
use crate::entity::{entity_id, Entity, EntityRef};
use crate::error::{RepoError, RepoResult};
use crate::keys::{self, validate_id};

/// Routes operations on bare ids to the owning collection.
pub struct Federation {
    store: Arc<dyn KvStore>,
    collections: Vec<CollectionRepository>,
    by_namespace: HashMap<String, usize>,
}

impl std::fmt::Debug for Federation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federation")
            .field("namespaces", &self.namespaces().collect::<Vec<_>>())
            .finish()
    }
}

impl Federation {
    pub fn new(store: Arc<dyn KvStore>, config: CatalogConfig) -> RepoResult<Self> {
        config.validate()?;
        let mut collections = Vec::with_capacity(config.collections.len());
        let mut by_namespace = HashMap::new();
        for (position, collection) in config.collections.into_iter().enumerate() {
            by_namespace.insert(collection.namespace.clone(), position);
            collections.push(CollectionRepository::new(store.clone(), collection)?);
        }
        Ok(Self {
            store,
            collections,
            by_namespace,
        })
    }

    /// Configured namespaces, in configuration order.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(CollectionRepository::namespace)
    }

    pub fn collections(&self) -> &[CollectionRepository] {
        &self.collections
    }

    pub fn collection(&self, namespace: &str) -> RepoResult<&CollectionRepository> {
        if namespace.is_empty() {
            return Err(RepoError::invalid("a namespace is required"));
        }
        self.by_namespace
            .get(namespace)
            .map(|&position| &self.collections[position])
            .ok_or_else(|| RepoError::invalid(format!("unknown namespace {namespace}")))
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Every entity of every collection, collection by collection.
    pub async fn get(&self) -> RepoResult<Vec<Entity>> {
        let mut entities = Vec::new();
        for collection in &self.collections {
            entities.extend(collection.get().await?);
        }
        Ok(entities)
    }

    pub async fn get_by_id(&self, id: &str) -> RepoResult<Entity> {
        self.get_by_ids(&[id.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RepoError::not_found([id]))
    }

    /// Fetch ids from whichever collections own them, in request order.
    pub async fn get_by_ids(&self, ids: &[String]) -> RepoResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let owners = self.locate(ids).await?;
        let missing: Vec<String> = ids
            .iter()
            .zip(&owners)
            .filter(|(_, owner)| owner.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(RepoError::NotFound { ids: missing });
        }

        let groups = group(ids.iter().cloned().zip(owners));
        let fetched = try_join_all(
            groups
                .iter()
                .map(|(&position, ids)| self.collections[position].get_by_ids(ids)),
        )
        .await?;

        let mut found: HashMap<String, Entity> = HashMap::new();
        for (ids, entities) in groups.values().zip(fetched) {
            found.extend(ids.iter().cloned().zip(entities));
        }
        ids.iter()
            .map(|id| found.get(id).cloned().ok_or_else(|| RepoError::not_found([id.as_str()])))
            .collect()
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    pub async fn create(&self, entity: Entity, namespace: &str) -> RepoResult<Entity> {
        self.collection(namespace)?.create(entity).await
    }

    pub async fn create_many(&self, entities: Vec<Entity>, namespace: &str) -> RepoResult<Vec<Entity>> {
        self.collection(namespace)?.create_many(entities).await
    }

    pub async fn update(&self, entity: Entity) -> RepoResult<usize> {
        self.update_many(vec![entity]).await
    }

    /// Update entities wherever they live. Counts are summed across
    /// collections; an unknown id or any collection's rejection fails the
    /// whole call before any write.
    pub async fn update_many(&self, entities: Vec<Entity>) -> RepoResult<usize> {
        if entities.is_empty() {
            return Ok(0);
        }
        let ids = entities
            .iter()
            .map(|e| self.federated_id(e))
            .collect::<RepoResult<Vec<_>>>()?;
        let owners = self.locate(&ids).await?;
        let missing: Vec<String> = ids
            .iter()
            .zip(&owners)
            .filter(|(_, owner)| owner.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(RepoError::NotFound { ids: missing });
        }
        tracing::debug!(count = entities.len(), "federated update");

        let prepared = try_join_all(
            group(entities.into_iter().zip(owners))
                .into_iter()
                .map(|(position, batch)| self.collections[position].prepare_update(batch)),
        )
        .await?;
        prepared
            .into_iter()
            .collect::<PreparedWrite>()
            .commit(&*self.store)
            .await
    }

    pub async fn delete(&self, target: impl Into<EntityRef>) -> RepoResult<usize> {
        self.delete_many(vec![target.into()]).await
    }

    /// Delete by id or body wherever the entity lives. Unknown ids count
    /// zero; a collision fails the whole call before any write.
    pub async fn delete_many(&self, targets: Vec<EntityRef>) -> RepoResult<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let ids = targets
            .iter()
            .map(|target| match target {
                EntityRef::Id(id) => Ok(id.clone()),
                EntityRef::Entity(entity) => self.federated_id(entity),
            })
            .collect::<RepoResult<Vec<_>>>()?;
        let owners = self.locate(&ids).await?;
        tracing::debug!(count = ids.len(), "federated delete");

        let prepared = try_join_all(
            group(ids.into_iter().map(EntityRef::Id).zip(owners))
                .into_iter()
                .map(|(position, batch)| self.collections[position].prepare_delete(batch)),
        )
        .await?;
        prepared
            .into_iter()
            .collect::<PreparedWrite>()
            .commit(&*self.store)
            .await
    }

    pub async fn order(&self, new_order: Option<&[String]>, namespace: &str) -> RepoResult<Vec<String>> {
        self.collection(namespace)?.order(new_order).await
    }

    /// Search every collection concurrently; results are concatenated in
    /// configuration order.
    pub async fn search(&self, filters: &Filters) -> RepoResult<Vec<Entity>> {
        let results = try_join_all(self.collections.iter().map(|c| c.search(filters))).await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Rebuild every collection in turn, keeping each current order.
    pub async fn rebuild_indexes(&self) -> RepoResult<Vec<(String, RebuildReport)>> {
        let mut reports = Vec::with_capacity(self.collections.len());
        for collection in &self.collections {
            let report = collection.rebuild_indexes(None).await?;
            reports.push((collection.namespace().to_string(), report));
        }
        Ok(reports)
    }

    // ---------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------

    /// Resolve each id to the position of its owning collection.
    ///
    /// `None` means no configured collection owns the id.
    async fn locate(&self, ids: &[String]) -> RepoResult<Vec<Option<usize>>> {
        let lookups = ids.iter().map(|id| async move {
            if validate_id(id).is_err() {
                return StoreResult::Ok(Vec::new());
            }
            self.store.hkeys(&keys::registry(id)).await
        });
        let registered = try_join_all(lookups).await?;

        ids.iter()
            .zip(registered)
            .map(|(id, namespaces)| match namespaces.as_slice() {
                [] => Ok(None),
                [namespace] => Ok(self.by_namespace.get(namespace).copied()),
                _ => {
                    tracing::error!(id = %id, ?namespaces, "id registered in several namespaces");
                    Err(RepoError::Collision {
                        id: id.clone(),
                        namespaces,
                    })
                }
            })
            .collect()
    }

    /// Read an entity's id with the first configured id property it carries.
    fn federated_id(&self, entity: &Entity) -> RepoResult<String> {
        for collection in &self.collections {
            if let Some(id) = entity_id(entity, collection.id_property())? {
                return Ok(id.to_string());
            }
        }
        Err(RepoError::invalid("entity carries no id property"))
    }
}

/// Bucket resolved items by collection position, dropping unresolved ones.
fn group<T>(items: impl IntoIterator<Item = (T, Option<usize>)>) -> BTreeMap<usize, Vec<T>> {
    let mut groups: BTreeMap<usize, Vec<T>> = BTreeMap::new();
    for (item, owner) in items {
        if let Some(position) = owner {
            groups.entry(position).or_default().push(item);
        }
    }
    groups
}
