//! CRUD, ordering, search, and index rebuild for one namespaced collection.
//!
//! Every mutating call is one read phase (pipelined existence, uniqueness,
//! and snapshot reads) followed by one guarded transaction. The read phase
//! produces precise errors; the guards make the write itself the arbiter,
//! so a writer that loses a race against a concurrent caller fails instead
//! of committing a duplicate or resurrecting a deleted entity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use catalog_store::{Command, Guard, KvStore, Reply, StoreError, Transaction, TxOutcome};
use futures::future::try_join_all;
use serde_json::Value;
use uuid::Uuid;

use crate::config::CollectionConfig;
use crate::entity::{decode_body, encode_body, entity_id, normalize_text, Entity, EntityRef};
use crate::error::{Conflict, RepoError, RepoResult};
use crate::index::{Claim, IndexDelta, IndexManager};
use crate::keys::{self, validate_id, KeyCodec, KeyKind};
use crate::ordering::reorder;
use crate::scan::{scan_hash, scan_keys};

/// Search filters: index property to raw query string.
pub type Filters = BTreeMap<String, String>;

/// Value stored in a registry field.
const REGISTRY_MARK: &str = "1";

/// Summary of an index rebuild.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Entity bodies found.
    pub entities: usize,
    /// Derived keys deleted before rewriting.
    pub derived_keys_removed: usize,
    /// Secondary index entries written.
    pub index_entries_written: usize,
    /// Registry fields of this namespace naming vanished bodies.
    pub registry_entries_removed: usize,
}

/// Why a transaction guard exists, used to report an abort.
#[derive(Clone, Debug)]
enum AbortReason {
    Taken(Conflict),
    Gone(String),
    /// A key read during the read phase no longer holds what was read.
    Changed(String),
}

impl From<AbortReason> for RepoError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Taken(conflict) => RepoError::AlreadyExists {
                conflicts: vec![conflict],
            },
            AbortReason::Gone(id) => RepoError::not_found([id]),
            AbortReason::Changed(key) => RepoError::Contended { key },
        }
    }
}

/// A transaction plus the meaning of each of its guards.
#[derive(Default)]
struct Guarded {
    tx: Transaction,
    reasons: Vec<AbortReason>,
}

impl Guarded {
    fn guard(&mut self, guard: Guard, reason: AbortReason) {
        self.tx.guard(guard);
        self.reasons.push(reason);
    }

    /// Append `other`, returning the reply position of its first command.
    fn append(&mut self, other: Guarded) -> usize {
        let offset = self.tx.commands.len();
        self.tx.guards.extend(other.tx.guards);
        self.tx.commands.extend(other.tx.commands);
        self.reasons.extend(other.reasons);
        offset
    }
}

/// A validated, guarded write that has not been committed yet.
///
/// Writes prepared by collections sharing one store can be merged and
/// committed as a single transaction.
#[derive(Default)]
pub(crate) struct PreparedWrite {
    guarded: Guarded,
    /// Part of the affected count known before commit.
    fixed: usize,
    /// Replies whose integers add to the affected count.
    counted: Vec<usize>,
}

impl PreparedWrite {
    pub(crate) fn merge(&mut self, other: PreparedWrite) {
        let offset = self.guarded.append(other.guarded);
        self.fixed += other.fixed;
        self.counted.extend(other.counted.into_iter().map(|i| i + offset));
    }

    /// Commit and return the number of entities affected.
    pub(crate) async fn commit(self, store: &dyn KvStore) -> RepoResult<usize> {
        if self.guarded.tx.is_empty() {
            return Ok(self.fixed);
        }
        let replies = commit(store, self.guarded).await?;
        let counted: i64 = self
            .counted
            .iter()
            .map(|&i| replies.get(i).map_or(0, Reply::as_int))
            .sum();
        Ok(self.fixed + usize::try_from(counted).unwrap_or(0))
    }
}

impl FromIterator<PreparedWrite> for PreparedWrite {
    fn from_iter<I: IntoIterator<Item = PreparedWrite>>(writes: I) -> Self {
        let mut merged = PreparedWrite::default();
        for write in writes {
            merged.merge(write);
        }
        merged
    }
}

/// Repository over one namespaced collection.
pub struct CollectionRepository {
    store: Arc<dyn KvStore>,
    config: CollectionConfig,
    codec: KeyCodec,
    indexes: IndexManager,
}

impl std::fmt::Debug for CollectionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionRepository")
            .field("namespace", &self.config.namespace)
            .field("indexes", &self.config.indexes.len())
            .finish()
    }
}

impl CollectionRepository {
    /// Build a repository after validating its configuration.
    pub fn new(store: Arc<dyn KvStore>, config: CollectionConfig) -> RepoResult<Self> {
        config.validate()?;
        let codec = KeyCodec::new(config.namespace.clone());
        let indexes = IndexManager::new(codec.clone(), config.indexes.clone());
        Ok(Self {
            store,
            config,
            codec,
            indexes,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn id_property(&self) -> &str {
        &self.config.id_property
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Every entity of the collection, in ordering-list order.
    pub async fn get(&self) -> RepoResult<Vec<Entity>> {
        let ids = self.current_order().await?;
        self.get_by_ids(&ids).await
    }

    /// Re-read the given entities by their id property.
    pub async fn get_matching(&self, entities: &[Entity]) -> RepoResult<Vec<Entity>> {
        let ids = entities
            .iter()
            .map(|e| self.require_id(e).map(str::to_string))
            .collect::<RepoResult<Vec<_>>>()?;
        self.get_by_ids(&ids).await
    }

    pub async fn get_by_id(&self, id: &str) -> RepoResult<Entity> {
        self.get_by_ids(&[id.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RepoError::not_found([id]))
    }

    /// Fetch many entities in one pipelined read, in request order.
    ///
    /// Fails with `NotFound` listing every missing id if any is absent.
    pub async fn get_by_ids(&self, ids: &[String]) -> RepoResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let bodies = self.read_bodies(ids).await?;
        let missing: Vec<String> = ids
            .iter()
            .zip(&bodies)
            .filter(|(_, body)| body.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(RepoError::NotFound { ids: missing });
        }
        Ok(bodies.into_iter().flatten().collect())
    }

    pub async fn exists(&self, id: &str) -> RepoResult<bool> {
        if validate_id(id).is_err() {
            return Ok(false);
        }
        Ok(self
            .store
            .exists(&[self.codec.body(id)])
            .await?
            .first()
            .copied()
            .unwrap_or(false))
    }

    /// Number of entities in the ordering list.
    pub async fn count(&self) -> RepoResult<usize> {
        Ok(self.current_order().await?.len())
    }

    // ---------------------------------------------------------------
    // Create
    // ---------------------------------------------------------------

    pub async fn create(&self, entity: Entity) -> RepoResult<Entity> {
        self.create_many(vec![entity])
            .await?
            .pop()
            .ok_or_else(|| RepoError::invalid("create produced no entity"))
    }

    /// Create a batch of entities, all or nothing.
    ///
    /// Items without an id receive a fresh UUID v7.
    pub async fn create_many(&self, entities: Vec<Entity>) -> RepoResult<Vec<Entity>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(namespace = %self.namespace(), count = entities.len(), "create");

        let mut prepared: Vec<(String, Entity, IndexDelta)> = Vec::with_capacity(entities.len());
        let mut seen = HashSet::new();
        let mut conflicts = Vec::new();
        let mut claimed: HashMap<Claim, String> = HashMap::new();

        for mut entity in entities {
            let id = match entity_id(&entity, self.id_property())? {
                Some(id) => id.to_string(),
                None => {
                    let id = Uuid::now_v7().to_string();
                    entity.insert(self.config.id_property.clone(), Value::String(id.clone()));
                    id
                }
            };
            validate_id(&id)?;
            if !seen.insert(id.clone()) {
                conflicts.push(Conflict::Id(id.clone()));
            }
            let delta = self.indexes.transition(&id, None, Some(&entity))?;
            for claim in &delta.claims {
                if let Some(other) = claimed.insert(claim.clone(), id.clone()) {
                    if other != id {
                        conflicts.push(value_conflict(claim));
                    }
                }
            }
            prepared.push((id, entity, delta));
        }
        if !conflicts.is_empty() {
            return Err(RepoError::AlreadyExists { conflicts });
        }

        // Read phase: ids and unique values already taken.
        let ids: Vec<String> = prepared.iter().map(|(id, ..)| id.clone()).collect();
        let body_keys: Vec<String> = ids.iter().map(|id| self.codec.body(id)).collect();
        let claims: Vec<(Claim, String)> = claimed.into_iter().collect();
        let no_releasers = HashMap::new();
        let (existing, taken) = futures::try_join!(
            async { self.store.exists(&body_keys).await.map_err(RepoError::from) },
            self.taken_values(&claims, &no_releasers),
        )?;
        let mut conflicts: Vec<Conflict> = ids
            .iter()
            .zip(existing)
            .filter(|(_, exists)| *exists)
            .map(|(id, _)| Conflict::Id(id.clone()))
            .collect();
        conflicts.extend(taken);
        if !conflicts.is_empty() {
            return Err(RepoError::AlreadyExists { conflicts });
        }

        // Write phase.
        let mut guarded = Guarded::default();
        for (id, _, delta) in &prepared {
            guarded.guard(
                Guard::key_absent(self.codec.body(id)),
                AbortReason::Taken(Conflict::Id(id.clone())),
            );
            for claim in &delta.claims {
                guarded.guard(
                    Guard::field_free(
                        self.codec.unique_index(&claim.property),
                        claim.value.clone(),
                        vec![id.clone()],
                    ),
                    AbortReason::Taken(value_conflict(claim)),
                );
            }
        }
        for (id, entity, delta) in &prepared {
            guarded.tx.push(Command::set(self.codec.body(id), encode_body(entity)));
            guarded.tx.extend(delta.writes.iter().cloned());
            guarded
                .tx
                .push(Command::hset(keys::registry(id), self.namespace(), REGISTRY_MARK));
        }
        guarded.tx.push(Command::rpush(self.codec.order(), ids));
        commit(&*self.store, guarded).await?;

        Ok(prepared.into_iter().map(|(_, entity, _)| entity).collect())
    }

    // ---------------------------------------------------------------
    // Update
    // ---------------------------------------------------------------

    pub async fn update(&self, entity: Entity) -> RepoResult<usize> {
        self.update_many(vec![entity]).await
    }

    /// Replace whole entities, recomputing their index entries.
    ///
    /// Returns the number of entities replaced. Unique values may move
    /// between entities of the same batch. A body changed by someone else
    /// between read and write fails the call with `Contended`.
    pub async fn update_many(&self, entities: Vec<Entity>) -> RepoResult<usize> {
        self.prepare_update(entities).await?.commit(&*self.store).await
    }

    pub(crate) async fn prepare_update(&self, entities: Vec<Entity>) -> RepoResult<PreparedWrite> {
        if entities.is_empty() {
            return Ok(PreparedWrite::default());
        }
        tracing::debug!(namespace = %self.namespace(), count = entities.len(), "update");

        let mut ids = Vec::with_capacity(entities.len());
        let mut seen = HashSet::new();
        for entity in &entities {
            let id = self.require_id(entity)?.to_string();
            if !seen.insert(id.clone()) {
                return Err(RepoError::invalid(format!(
                    "{id} appears more than once in one update"
                )));
            }
            ids.push(id);
        }

        // Read phase: membership and previous bodies.
        let (order, previous) = futures::try_join!(self.current_order(), self.read_stored(&ids))?;
        let listed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let missing: Vec<String> = ids
            .iter()
            .zip(&previous)
            .filter(|(id, stored)| stored.is_none() || !listed.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(RepoError::NotFound { ids: missing });
        }

        let mut deltas = Vec::with_capacity(entities.len());
        for ((id, new), old) in ids.iter().zip(&entities).zip(&previous) {
            let old = old.as_ref().map(|(_, entity)| entity);
            deltas.push(self.indexes.transition(id, old, Some(new))?);
        }

        let releasers: HashMap<Claim, String> = ids
            .iter()
            .zip(&deltas)
            .flat_map(|(id, delta)| delta.releases.iter().map(move |c| (c.clone(), id.clone())))
            .collect();
        let mut claimed: HashMap<Claim, String> = HashMap::new();
        let mut conflicts = Vec::new();
        for (id, delta) in ids.iter().zip(&deltas) {
            for claim in &delta.claims {
                if claimed.insert(claim.clone(), id.clone()).is_some() {
                    conflicts.push(value_conflict(claim));
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(RepoError::AlreadyExists { conflicts });
        }
        let claims: Vec<(Claim, String)> = claimed.into_iter().collect();
        let taken = self.taken_values(&claims, &releasers).await?;
        if !taken.is_empty() {
            return Err(RepoError::AlreadyExists { conflicts: taken });
        }

        // Write phase: every removal before any write. Removals were derived
        // from the bodies read above, so those bodies must still be in place.
        let mut guarded = Guarded::default();
        for ((id, delta), stored) in ids.iter().zip(&deltas).zip(&previous) {
            let body = self.codec.body(id);
            guarded.guard(Guard::key_present(body.clone()), AbortReason::Gone(id.clone()));
            if let Some((raw, _)) = stored {
                guarded.guard(Guard::value_equals(body.clone(), raw.clone()), AbortReason::Changed(body));
            }
            for claim in &delta.claims {
                let mut owners = vec![id.clone()];
                owners.extend(releasers.get(claim).cloned());
                guarded.guard(
                    Guard::field_free(self.codec.unique_index(&claim.property), claim.value.clone(), owners),
                    AbortReason::Taken(value_conflict(claim)),
                );
            }
        }
        for delta in &deltas {
            guarded.tx.extend(delta.removals.iter().cloned());
        }
        for delta in deltas {
            guarded.tx.extend(delta.writes);
        }
        for (id, entity) in ids.iter().zip(&entities) {
            guarded.tx.push(Command::set(self.codec.body(id), encode_body(entity)));
        }

        Ok(PreparedWrite {
            guarded,
            fixed: ids.len(),
            counted: Vec::new(),
        })
    }

    // ---------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------

    pub async fn delete(&self, target: impl Into<EntityRef>) -> RepoResult<usize> {
        self.delete_many(vec![target.into()]).await
    }

    /// Delete entities by id or by body.
    ///
    /// Returns how many entity bodies were actually removed; absent targets
    /// count zero and are not an error.
    pub async fn delete_many(&self, targets: Vec<EntityRef>) -> RepoResult<usize> {
        self.prepare_delete(targets).await?.commit(&*self.store).await
    }

    pub(crate) async fn prepare_delete(&self, targets: Vec<EntityRef>) -> RepoResult<PreparedWrite> {
        let mut ids = Vec::with_capacity(targets.len());
        let mut seen = HashSet::new();
        for target in &targets {
            let id = target.id(self.id_property())?;
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Ok(PreparedWrite::default());
        }
        tracing::debug!(namespace = %self.namespace(), count = ids.len(), "delete");

        let stored = self.read_stored(&ids).await?;
        let mut guarded = Guarded::default();
        let mut counted = Vec::new();
        for (id, stored) in ids.iter().zip(&stored) {
            let Some((raw, body)) = stored else {
                continue;
            };
            let key = self.codec.body(id);
            guarded.guard(Guard::value_equals(key.clone(), raw.clone()), AbortReason::Changed(key.clone()));
            let delta = self.indexes.transition(id, Some(body), None)?;
            guarded.tx.extend(delta.removals);
            counted.push(guarded.tx.push(Command::del(key)));
            guarded.tx.push(Command::lrem_all(self.codec.order(), id.clone()));
            guarded.tx.push(Command::hdel(keys::registry(id), self.namespace()));
        }

        Ok(PreparedWrite {
            guarded,
            fixed: 0,
            counted,
        })
    }

    // ---------------------------------------------------------------
    // Ordering
    // ---------------------------------------------------------------

    /// Read the ordering list, or apply a new relative order to it.
    ///
    /// With `Some(new_order)`, mentioned ids that still exist come first in
    /// the given sequence and every other id trails in its prior order. If
    /// the list changes before the new order is written the call fails with
    /// `Contended` and the list is left as the other writer made it.
    pub async fn order(&self, new_order: Option<&[String]>) -> RepoResult<Vec<String>> {
        let current = self.current_order().await?;
        let Some(requested) = new_order else {
            return Ok(current);
        };
        let next = reorder(&current, requested);
        if next != current {
            tracing::debug!(namespace = %self.namespace(), len = next.len(), "reorder");
            let mut guarded = Guarded::default();
            guarded.guard(
                Guard::list_equals(self.codec.order(), current),
                AbortReason::Changed(self.codec.order()),
            );
            guarded.tx.push(Command::del(self.codec.order()));
            guarded.tx.push(Command::rpush(self.codec.order(), next.clone()));
            commit(&*self.store, guarded).await?;
        }
        Ok(next)
    }

    // ---------------------------------------------------------------
    // Search
    // ---------------------------------------------------------------

    /// Substring search across index properties, AND-ed across filters.
    ///
    /// Filters on properties that are not indexed here are ignored; with no
    /// consulted filter the result is empty.
    pub async fn search(&self, filters: &Filters) -> RepoResult<Vec<Entity>> {
        let consulted: Vec<(&str, bool, String)> = filters
            .iter()
            .filter_map(|(property, query)| {
                self.indexes
                    .spec(property)
                    .map(|spec| (property.as_str(), spec.unique, normalize_text(query)))
            })
            .collect();
        if consulted.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(namespace = %self.namespace(), filters = consulted.len(), "search");

        let matches = try_join_all(
            consulted
                .iter()
                .map(|(property, unique, query)| self.match_filter(property, *unique, query)),
        )
        .await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for ids in matches {
            for id in ids {
                *counts.entry(id).or_default() += 1;
            }
        }
        let hits: HashSet<String> = counts
            .into_iter()
            .filter(|(_, n)| *n == consulted.len())
            .map(|(id, _)| id)
            .collect();
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = self
            .current_order()
            .await?
            .into_iter()
            .filter(|id| hits.contains(id))
            .collect();
        // Ids deleted since the scan are skipped rather than reported.
        Ok(self.read_bodies(&ids).await?.into_iter().flatten().collect())
    }

    /// Ids whose normalized `property` value contains `query`.
    async fn match_filter(&self, property: &str, unique: bool, query: &str) -> RepoResult<BTreeSet<String>> {
        let batch = self.config.scan_batch;
        if unique {
            let hits = scan_hash(
                &*self.store,
                &self.codec.unique_index(property),
                &keys::contains_pattern(query),
                batch,
            )
            .await?;
            return Ok(hits.into_values().collect());
        }

        let markers: Vec<String> = scan_keys(&*self.store, &self.codec.marker_pattern(property), batch)
            .await?
            .into_iter()
            .collect();
        if markers.is_empty() {
            return Ok(BTreeSet::new());
        }
        let values = self.store.mget(&markers).await?;
        Ok(markers
            .iter()
            .zip(values)
            .filter_map(|(key, value)| {
                value
                    .filter(|v| v.contains(query))
                    .and_then(|_| self.codec.marker_id(property, key))
                    .map(str::to_string)
            })
            .collect())
    }

    // ---------------------------------------------------------------
    // Rebuild
    // ---------------------------------------------------------------

    /// Reconstruct every derived key of the collection from entity bodies.
    ///
    /// The ordering list is rebuilt from `order` when given, else from the
    /// current list; bodies it does not mention trail in key order. Callers
    /// must keep writers away from the collection while this runs.
    pub async fn rebuild_indexes(&self, order: Option<&[String]>) -> RepoResult<RebuildReport> {
        let namespace = self.namespace();
        let batch = self.config.scan_batch;
        tracing::info!(namespace, "rebuilding indexes");

        let mut derived = Vec::new();
        let mut ids = Vec::new();
        for key in scan_keys(&*self.store, &self.codec.namespace_pattern(), batch).await? {
            match self.codec.classify(&key) {
                KeyKind::Body(id) if validate_id(id).is_ok() => ids.push(id.to_string()),
                KeyKind::Body(id) => tracing::warn!(namespace, id = %id, "skipping body with invalid id"),
                KeyKind::Derived => derived.push(key.clone()),
                KeyKind::Foreign => {}
            }
        }

        let bodies = self.read_bodies(&ids).await?;
        let mut entities = Vec::with_capacity(ids.len());
        for (id, body) in ids.into_iter().zip(bodies) {
            match body {
                Some(entity) => entities.push((id, entity)),
                None => tracing::warn!(namespace, id = %id, "skipping non-string body key"),
            }
        }

        let mut writes = Vec::new();
        let mut claimed: HashMap<Claim, String> = HashMap::new();
        let mut conflicts = Vec::new();
        for (id, entity) in &entities {
            let delta = self.indexes.transition(id, None, Some(entity))?;
            for claim in &delta.claims {
                if claimed.insert(claim.clone(), id.clone()).is_some() {
                    conflicts.push(value_conflict(claim));
                }
            }
            writes.extend(delta.writes);
        }
        if !conflicts.is_empty() {
            return Err(RepoError::AlreadyExists { conflicts });
        }

        let preferred = match order {
            Some(order) => order.to_vec(),
            None => self.current_order().await?,
        };
        let present: Vec<String> = entities.iter().map(|(id, _)| id.clone()).collect();
        let next = reorder(&present, &preferred);

        // Registry fields of this namespace pointing at vanished bodies.
        let alive: HashSet<&str> = present.iter().map(String::as_str).collect();
        let candidates: Vec<String> = scan_keys(&*self.store, &keys::registry_pattern(), batch)
            .await?
            .iter()
            .filter_map(|key| keys::registry_id(key))
            .filter(|id| !alive.contains(id))
            .map(str::to_string)
            .collect();
        let marks = try_join_all(candidates.iter().map(|id| {
            let key = keys::registry(id);
            async move { self.store.hget(&key, namespace).await }
        }))
        .await?;
        let stale: Vec<String> = candidates
            .into_iter()
            .zip(marks)
            .filter(|(_, mark)| mark.is_some())
            .map(|(id, _)| id)
            .collect();

        let report = RebuildReport {
            entities: entities.len(),
            derived_keys_removed: derived.len(),
            index_entries_written: writes.len(),
            registry_entries_removed: stale.len(),
        };

        let mut guarded = Guarded::default();
        for key in derived {
            guarded.tx.push(Command::del(key));
        }
        for id in &stale {
            guarded.tx.push(Command::hdel(keys::registry(id), namespace));
        }
        if !next.is_empty() {
            guarded.tx.push(Command::rpush(self.codec.order(), next));
        }
        guarded.tx.extend(writes);
        for (id, _) in &entities {
            guarded
                .tx
                .push(Command::hset(keys::registry(id), namespace, REGISTRY_MARK));
        }
        if !guarded.tx.is_empty() {
            commit(&*self.store, guarded).await?;
        }

        tracing::info!(
            namespace,
            entities = report.entities,
            removed = report.derived_keys_removed,
            written = report.index_entries_written,
            unregistered = report.registry_entries_removed,
            "indexes rebuilt"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    async fn current_order(&self) -> RepoResult<Vec<String>> {
        Ok(self.store.lrange(&self.codec.order(), 0, -1).await?)
    }

    fn require_id<'e>(&self, entity: &'e Entity) -> RepoResult<&'e str> {
        entity_id(entity, self.id_property())?
            .ok_or_else(|| RepoError::invalid(format!("entity has no {} property", self.id_property())))
    }

    /// Read bodies in one `mget`; ids that cannot name a body read as absent.
    async fn read_bodies(&self, ids: &[String]) -> RepoResult<Vec<Option<Entity>>> {
        Ok(self
            .read_stored(ids)
            .await?
            .into_iter()
            .map(|stored| stored.map(|(_, entity)| entity))
            .collect())
    }

    /// Like [`read_bodies`](Self::read_bodies), keeping each raw body too.
    async fn read_stored(&self, ids: &[String]) -> RepoResult<Vec<Option<(String, Entity)>>> {
        let keys: Vec<String> = ids
            .iter()
            .filter(|id| validate_id(id).is_ok())
            .map(|id| self.codec.body(id))
            .collect();
        let mut raw = if keys.is_empty() {
            Vec::new().into_iter()
        } else {
            self.store.mget(&keys).await?.into_iter()
        };
        ids.iter()
            .map(|id| {
                if validate_id(id).is_err() {
                    return Ok(None);
                }
                match raw.next().flatten() {
                    None => Ok(None),
                    Some(body) => {
                        let entity = decode_body(&self.codec.body(id), &body, self.id_property(), id)?;
                        Ok(Some((body, entity)))
                    }
                }
            })
            .collect()
    }

    /// Unique values held by someone other than the claimant or a batch
    /// member releasing them.
    async fn taken_values(
        &self,
        claims: &[(Claim, String)],
        releasers: &HashMap<Claim, String>,
    ) -> RepoResult<Vec<Conflict>> {
        let mut by_property: BTreeMap<&str, Vec<&(Claim, String)>> = BTreeMap::new();
        for entry in claims {
            by_property.entry(entry.0.property.as_str()).or_default().push(entry);
        }
        let lookups = by_property.iter().map(|(property, entries)| {
            let fields: Vec<String> = entries.iter().map(|(claim, _)| claim.value.clone()).collect();
            let key = self.codec.unique_index(property);
            async move { self.store.hmget(&key, &fields).await }
        });
        let holders = try_join_all(lookups).await?;

        let mut conflicts = Vec::new();
        for (entries, holders) in by_property.values().zip(holders) {
            for ((claim, owner), holder) in entries.iter().map(|e| (&e.0, &e.1)).zip(holders) {
                let Some(holder) = holder else {
                    continue;
                };
                let released = releasers.get(claim).is_some_and(|r| *r == holder);
                if holder != *owner && !released {
                    conflicts.push(value_conflict(claim));
                }
            }
        }
        Ok(conflicts)
    }
}

/// Execute a guarded transaction, mapping a failed guard to its error.
async fn commit(store: &dyn KvStore, guarded: Guarded) -> RepoResult<Vec<Reply>> {
    let Guarded { tx, reasons } = guarded;
    match store.exec(tx).await? {
        TxOutcome::Committed(replies) => Ok(replies),
        TxOutcome::Aborted { guard } => {
            let reason = reasons.into_iter().nth(guard);
            tracing::warn!(guard, ?reason, "transaction aborted by guard");
            Err(match reason {
                Some(reason) => reason.into(),
                None => RepoError::Store(StoreError::Unavailable(format!(
                    "transaction aborted on unknown guard {guard}"
                ))),
            })
        }
    }
}

fn value_conflict(claim: &Claim) -> Conflict {
    Conflict::Value {
        property: claim.property.clone(),
        value: claim.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexSpec;
    use async_trait::async_trait;
    use catalog_store::{InMemoryKvStore, ScanPage, StoreResult};
    use serde_json::json;
    use std::sync::Mutex;

    fn doc(value: Value) -> Entity {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn movies_config() -> CollectionConfig {
        CollectionConfig::new("movies:")
            .with_index("title", IndexSpec::unique())
            .with_index("genre", IndexSpec::plain())
            .with_scan_batch(4)
    }

    fn setup() -> (Arc<InMemoryKvStore>, CollectionRepository) {
        let store = Arc::new(InMemoryKvStore::new());
        let repo = CollectionRepository::new(store.clone(), movies_config()).unwrap();
        (store, repo)
    }

    async fn seed(repo: &CollectionRepository) {
        repo.create_many(vec![
            doc(json!({"_id": "a", "title": "Alien", "genre": "Horror"})),
            doc(json!({"_id": "b", "title": "Blade Runner", "genre": "Sci-Fi"})),
            doc(json!({"_id": "c", "title": "Contact", "genre": "Sci-Fi"})),
        ])
        .await
        .unwrap();
    }

    fn ids_of(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e["_id"].as_str().unwrap()).collect()
    }

    fn filters(pairs: &[(&str, &str)]) -> Filters {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    // ---------------------------------------------------------------
    // create / get
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn create_assigns_id_and_round_trips() {
        let (_, repo) = setup();
        let created = repo
            .create(doc(json!({"title": "Alien", "year": 1979})))
            .await
            .unwrap();
        let id = created["_id"].as_str().unwrap().to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let fetched = repo.get_by_id(&id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(repo.count().await.unwrap(), 1);
        assert!(repo.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn get_follows_ordering_list() {
        let (_, repo) = setup();
        seed(&repo).await;
        assert_eq!(ids_of(&repo.get().await.unwrap()), vec!["a", "b", "c"]);

        let again = repo.get_matching(&[doc(json!({"_id": "c"}))]).await.unwrap();
        assert_eq!(again[0]["title"], json!("Contact"));
    }

    #[tokio::test]
    async fn get_by_ids_reports_every_missing_id() {
        let (_, repo) = setup();
        seed(&repo).await;
        let err = repo
            .get_by_ids(&["a".into(), "x".into(), "y".into()])
            .await
            .unwrap_err();
        match err {
            RepoError::NotFound { ids } => assert_eq!(ids, vec!["x", "y"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(repo.get_by_id("~order").await.is_err());
    }

    #[tokio::test]
    async fn create_existing_id_leaves_collection_unchanged() {
        let (store, repo) = setup();
        seed(&repo).await;
        let before = store.snapshot();

        let err = repo
            .create_many(vec![
                doc(json!({"_id": "d", "title": "Dune"})),
                doc(json!({"_id": "a", "title": "Arrival"})),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists { .. }));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn unique_values_collide_after_normalization() {
        let (_, repo) = setup();
        seed(&repo).await;

        let err = repo
            .create(doc(json!({"title": "  ALIEN "})))
            .await
            .unwrap_err();
        match err {
            RepoError::AlreadyExists { conflicts } => assert_eq!(
                conflicts,
                vec![Conflict::Value {
                    property: "title".into(),
                    value: "alien".into()
                }]
            ),
            other => panic!("unexpected {other:?}"),
        }
        repo.create(doc(json!({"title": "Aliens"}))).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn duplicates_within_one_batch_are_rejected() {
        let (_, repo) = setup();
        let err = repo
            .create_many(vec![
                doc(json!({"title": "Alien"})),
                doc(json!({"title": "alien"})),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists { .. }));

        let err = repo
            .create_many(vec![
                doc(json!({"_id": "x", "title": "One"})),
                doc(json!({"_id": "x", "title": "Two"})),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists { .. }));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn required_index_rejects_whole_batch() {
        let (store, repo) = setup();
        let err = repo
            .create_many(vec![
                doc(json!({"title": "Alien"})),
                doc(json!({"genre": "drama"})),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidRequest(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_reserved_ids() {
        let (_, repo) = setup();
        for id in ["~order", "a*", ""] {
            let err = repo
                .create(doc(json!({"_id": id, "title": id})))
                .await
                .unwrap_err();
            assert!(matches!(err, RepoError::InvalidRequest(_)), "{id}");
        }
        let err = repo.create(doc(json!({"_id": 5, "title": "Five"}))).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn create_registers_id() {
        let (store, repo) = setup();
        seed(&repo).await;
        assert_eq!(store.hkeys("~registry:a").await.unwrap(), vec!["movies:"]);
    }

    // ---------------------------------------------------------------
    // update
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn update_replaces_body_and_indexes() {
        let (_, repo) = setup();
        seed(&repo).await;

        let n = repo
            .update(doc(json!({"_id": "a", "title": "Aliens", "genre": "Action"})))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(repo.get_by_id("a").await.unwrap()["title"], json!("Aliens"));

        // The old title is free again.
        repo.create(doc(json!({"_id": "d", "title": "Alien"}))).await.unwrap();
        assert_eq!(
            ids_of(&repo.search(&filters(&[("genre", "action")])).await.unwrap()),
            vec!["a"]
        );
        assert!(repo.search(&filters(&[("genre", "horror")])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let (store, repo) = setup();
        seed(&repo).await;
        let before = store.snapshot();
        let err = repo
            .update_many(vec![
                doc(json!({"_id": "a", "title": "Alien 2"})),
                doc(json!({"_id": "zz", "title": "Nothing"})),
            ])
            .await
            .unwrap_err();
        match err {
            RepoError::NotFound { ids } => assert_eq!(ids, vec!["zz"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn update_cannot_take_a_held_value() {
        let (_, repo) = setup();
        seed(&repo).await;
        let err = repo
            .update(doc(json!({"_id": "a", "title": "contact"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists { .. }));
        assert_eq!(repo.get_by_id("a").await.unwrap()["title"], json!("Alien"));
    }

    #[tokio::test]
    async fn batch_update_may_swap_unique_values() {
        let (_, repo) = setup();
        seed(&repo).await;
        repo.update_many(vec![
            doc(json!({"_id": "a", "title": "Contact", "genre": "Horror"})),
            doc(json!({"_id": "c", "title": "Alien", "genre": "Sci-Fi"})),
        ])
        .await
        .unwrap();

        let hits = repo.search(&filters(&[("title", "alien")])).await.unwrap();
        assert_eq!(ids_of(&hits), vec!["c"]);
        let hits = repo.search(&filters(&[("title", "contact")])).await.unwrap();
        assert_eq!(ids_of(&hits), vec!["a"]);
    }

    #[tokio::test]
    async fn update_without_id_is_invalid() {
        let (_, repo) = setup();
        let err = repo.update(doc(json!({"title": "x"}))).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidRequest(_)));
    }

    // ---------------------------------------------------------------
    // delete
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn delete_removes_body_order_and_indexes() {
        let (store, repo) = setup();
        seed(&repo).await;

        assert_eq!(repo.delete("a").await.unwrap(), 1);
        assert!(matches!(repo.get_by_id("a").await, Err(RepoError::NotFound { .. })));
        assert_eq!(repo.order(None).await.unwrap(), vec!["b", "c"]);
        assert!(store.hkeys("~registry:a").await.unwrap().is_empty());

        // The title can be claimed again.
        repo.create(doc(json!({"title": "Alien"}))).await.unwrap();
    }

    #[tokio::test]
    async fn delete_counts_only_present_bodies() {
        let (_, repo) = setup();
        seed(&repo).await;
        let entity_b = repo.get_by_id("b").await.unwrap();
        let removed = repo
            .delete_many(vec!["c".into(), EntityRef::from(entity_b), "nope".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.delete("nope").await.unwrap(), 0);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deleting_everything_leaves_no_keys_behind() {
        let (store, repo) = setup();
        seed(&repo).await;
        repo.delete_many(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert!(store.is_empty(), "left behind: {:?}", store.keys());
    }

    // ---------------------------------------------------------------
    // order
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn order_moves_mentioned_ids_first() {
        let (_, repo) = setup();
        seed(&repo).await;
        let next = repo
            .order(Some(&["c".to_string(), "a".to_string()]))
            .await
            .unwrap();
        assert_eq!(next, vec!["c", "a", "b"]);
        assert_eq!(ids_of(&repo.get().await.unwrap()), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn empty_order_is_idempotent() {
        let (store, repo) = setup();
        seed(&repo).await;
        let before = store.snapshot();
        assert_eq!(repo.order(Some(&[])).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn order_ignores_unknown_ids() {
        let (_, repo) = setup();
        seed(&repo).await;
        let next = repo
            .order(Some(&["zz".to_string(), "b".to_string()]))
            .await
            .unwrap();
        assert_eq!(next, vec!["b", "a", "c"]);
    }

    // ---------------------------------------------------------------
    // search
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn search_matches_substrings_in_order() {
        let (_, repo) = setup();
        seed(&repo).await;
        repo.order(Some(&["c".to_string()])).await.unwrap();

        let hits = repo.search(&filters(&[("genre", "SCI")])).await.unwrap();
        assert_eq!(ids_of(&hits), vec!["c", "b"]);

        let hits = repo.search(&filters(&[("title", "  RUN ")])).await.unwrap();
        assert_eq!(ids_of(&hits), vec!["b"]);
    }

    #[tokio::test]
    async fn search_ands_filters() {
        let (_, repo) = setup();
        seed(&repo).await;
        let hits = repo
            .search(&filters(&[("genre", "sci"), ("title", "con")]))
            .await
            .unwrap();
        assert_eq!(ids_of(&hits), vec!["c"]);

        let hits = repo
            .search(&filters(&[("genre", "horror"), ("title", "con")]))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_ignores_unindexed_filters() {
        let (_, repo) = setup();
        seed(&repo).await;
        let hits = repo
            .search(&filters(&[("genre", "horror"), ("year", "1979")]))
            .await
            .unwrap();
        assert_eq!(ids_of(&hits), vec!["a"]);
        assert!(repo.search(&filters(&[("year", "1979")])).await.unwrap().is_empty());
        assert!(repo.search(&Filters::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_treats_pattern_characters_literally() {
        let (_, repo) = setup();
        repo.create(doc(json!({"_id": "q", "title": "What? [Really]"})))
            .await
            .unwrap();
        repo.create(doc(json!({"_id": "r", "title": "Whatever"}))).await.unwrap();
        let hits = repo.search(&filters(&[("title", "what?")])).await.unwrap();
        assert_eq!(ids_of(&hits), vec!["q"]);
    }

    // ---------------------------------------------------------------
    // rebuild
    // ---------------------------------------------------------------

    async fn drop_derived_keys(store: &InMemoryKvStore, include_order: bool) {
        let doomed: Vec<String> = store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("movies:~") && (include_order || k != "movies:~order"))
            .collect();
        store.del(&doomed).await.unwrap();
    }

    #[tokio::test]
    async fn rebuild_restores_search_and_order() {
        let (store, repo) = setup();
        seed(&repo).await;
        let order = repo.order(Some(&["b".to_string()])).await.unwrap();
        let sci = filters(&[("genre", "sci")]);
        let before = repo.search(&sci).await.unwrap();

        drop_derived_keys(&store, true).await;
        assert!(repo.search(&sci).await.unwrap().is_empty());

        let report = repo.rebuild_indexes(Some(&order)).await.unwrap();
        assert_eq!(report.entities, 3);
        assert_eq!(report.index_entries_written, 6);
        assert_eq!(repo.search(&sci).await.unwrap(), before);
        assert_eq!(repo.order(None).await.unwrap(), order);
    }

    #[tokio::test]
    async fn rebuild_keeps_current_order_by_default() {
        let (store, repo) = setup();
        seed(&repo).await;
        repo.order(Some(&["c".to_string()])).await.unwrap();
        drop_derived_keys(&store, false).await;

        repo.rebuild_indexes(None).await.unwrap();
        assert_eq!(repo.order(None).await.unwrap(), vec!["c", "a", "b"]);
        let hits = repo.search(&filters(&[("title", "blade")])).await.unwrap();
        assert_eq!(ids_of(&hits), vec!["b"]);
    }

    #[tokio::test]
    async fn rebuild_discards_stale_entries() {
        let (store, repo) = setup();
        seed(&repo).await;
        // Bodies removed out-of-band leave derived keys behind.
        store.del(&["movies:a".to_string()]).await.unwrap();
        store.set("movies:~m:genre:ghost", "horror").await.unwrap();

        let report = repo.rebuild_indexes(None).await.unwrap();
        assert_eq!(report.entities, 2);
        assert!(report.derived_keys_removed >= 4);
        assert_eq!(repo.order(None).await.unwrap(), vec!["b", "c"]);
        assert!(repo.search(&filters(&[("genre", "horror")])).await.unwrap().is_empty());
        assert!(store.hkeys("~registry:a").await.unwrap().is_empty());
        assert_eq!(store.hkeys("~registry:b").await.unwrap(), vec!["movies:"]);
        assert_eq!(report.registry_entries_removed, 1);
    }

    #[tokio::test]
    async fn rebuild_leaves_other_namespaces_registered() {
        let (store, repo) = setup();
        seed(&repo).await;
        let shows = CollectionRepository::new(store.clone(), CollectionConfig::new("shows:")).unwrap();
        shows.create(doc(json!({"_id": "s1", "title": "Lost"}))).await.unwrap();
        let mut tx = Transaction::new();
        tx.push(Command::hset("~registry:ghost", "movies:", REGISTRY_MARK));
        store.exec(tx).await.unwrap();

        let report = repo.rebuild_indexes(None).await.unwrap();
        assert_eq!(report.registry_entries_removed, 1);
        assert!(store.hkeys("~registry:ghost").await.unwrap().is_empty());
        assert_eq!(store.hkeys("~registry:s1").await.unwrap(), vec!["shows:"]);
        assert_eq!(shows.get_by_id("s1").await.unwrap()["title"], json!("Lost"));
    }

    #[tokio::test]
    async fn rebuild_fails_on_duplicate_unique_values() {
        let (store, repo) = setup();
        seed(&repo).await;
        store
            .set("movies:z", r#"{"_id":"z","title":"alien"}"#)
            .await
            .unwrap();
        let err = repo.rebuild_indexes(None).await.unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn corrupt_body_is_reported() {
        let (store, repo) = setup();
        seed(&repo).await;
        store.set("movies:a", "not json").await.unwrap();
        assert!(matches!(
            repo.get_by_id("a").await,
            Err(RepoError::CorruptEntity { .. })
        ));
    }

    // ---------------------------------------------------------------
    // guards
    // ---------------------------------------------------------------

    /// Store that runs one competing transaction right before the next
    /// `exec`, after the caller's read phase has passed.
    struct InterleavingStore {
        inner: InMemoryKvStore,
        interloper: Mutex<Option<Transaction>>,
    }

    impl InterleavingStore {
        fn new(interloper: Transaction) -> Self {
            Self {
                inner: InMemoryKvStore::new(),
                interloper: Mutex::new(Some(interloper)),
            }
        }
    }

    #[async_trait]
    impl KvStore for InterleavingStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
            self.inner.mget(keys).await
        }
        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.inner.set(key, value).await
        }
        async fn del(&self, keys: &[String]) -> StoreResult<u64> {
            self.inner.del(keys).await
        }
        async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
            self.inner.lrange(key, start, stop).await
        }
        async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
            self.inner.hget(key, field).await
        }
        async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
            self.inner.hmget(key, fields).await
        }
        async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.hkeys(key).await
        }
        async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage<String>> {
            self.inner.scan(cursor, pattern, count).await
        }
        async fn hscan(
            &self,
            key: &str,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> StoreResult<ScanPage<(String, String)>> {
            self.inner.hscan(key, cursor, pattern, count).await
        }
        async fn exists(&self, keys: &[String]) -> StoreResult<Vec<bool>> {
            self.inner.exists(keys).await
        }
        async fn exec(&self, tx: Transaction) -> StoreResult<TxOutcome> {
            let competing = self.interloper.lock().unwrap().take();
            if let Some(competing) = competing {
                self.inner.exec(competing).await?;
            }
            self.inner.exec(tx).await
        }
    }

    #[tokio::test]
    async fn racing_writer_for_same_value_loses() {
        let mut competing = Transaction::new();
        competing.push(Command::set("movies:rival", r#"{"_id":"rival","title":"Alien"}"#));
        competing.push(Command::hset("movies:~u:title", "alien", "rival"));
        competing.push(Command::rpush("movies:~order", vec!["rival".into()]));
        let store = Arc::new(InterleavingStore::new(competing));
        let repo = CollectionRepository::new(store.clone(), movies_config()).unwrap();

        let err = repo.create(doc(json!({"_id": "mine", "title": "alien"}))).await.unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists { .. }));
        assert_eq!(repo.order(None).await.unwrap(), vec!["rival"]);
        assert!(!repo.exists("mine").await.unwrap());
    }

    #[tokio::test]
    async fn update_racing_a_delete_is_not_found() {
        let mut competing = Transaction::new();
        competing.push(Command::del("movies:a"));
        competing.push(Command::lrem_all("movies:~order", "a"));
        let store = Arc::new(InterleavingStore::new(Transaction::new()));
        let repo = CollectionRepository::new(store.clone(), movies_config()).unwrap();
        repo.create(doc(json!({"_id": "a", "title": "Alien"}))).await.unwrap();
        *store.interloper.lock().unwrap() = Some(competing);

        let err = repo
            .update(doc(json!({"_id": "a", "title": "Alien 3"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound { .. }));
        assert!(!repo.exists("a").await.unwrap());
    }

    /// A seeded repository whose next write is preceded by `competing`.
    async fn seeded_interleaving(competing: Transaction) -> (Arc<InterleavingStore>, CollectionRepository) {
        let store = Arc::new(InterleavingStore::new(Transaction::new()));
        let repo = CollectionRepository::new(store.clone(), movies_config()).unwrap();
        seed(&repo).await;
        *store.interloper.lock().unwrap() = Some(competing);
        (store, repo)
    }

    /// Another writer renames `a` from "Alien" to "Aliens".
    fn rename_a_to_aliens() -> Transaction {
        let mut competing = Transaction::new();
        competing.push(Command::set(
            "movies:a",
            r#"{"_id":"a","title":"Aliens","genre":"Horror"}"#,
        ));
        competing.push(Command::hdel("movies:~u:title", "alien"));
        competing.push(Command::hset("movies:~u:title", "aliens", "a"));
        competing
    }

    #[tokio::test]
    async fn order_racing_a_create_keeps_the_new_id() {
        let mut competing = Transaction::new();
        competing.push(Command::set("movies:d", r#"{"_id":"d","title":"Dune"}"#));
        competing.push(Command::rpush("movies:~order", vec!["d".into()]));
        let (_, repo) = seeded_interleaving(competing).await;

        let err = repo.order(Some(&["c".to_string()])).await.unwrap_err();
        assert!(matches!(err, RepoError::Contended { ref key } if key == "movies:~order"));
        assert_eq!(repo.order(None).await.unwrap(), vec!["a", "b", "c", "d"]);

        let next = repo.order(Some(&["c".to_string()])).await.unwrap();
        assert_eq!(next, vec!["c", "a", "b", "d"]);
    }

    #[tokio::test]
    async fn delete_racing_an_update_keeps_its_claims() {
        let (store, repo) = seeded_interleaving(rename_a_to_aliens()).await;

        let err = repo.delete("a").await.unwrap_err();
        assert!(matches!(err, RepoError::Contended { ref key } if key == "movies:a"));
        assert_eq!(
            store.hget("movies:~u:title", "aliens").await.unwrap().as_deref(),
            Some("a")
        );

        // Retrying sees the new title and releases it.
        assert_eq!(repo.delete("a").await.unwrap(), 1);
        assert!(store.hget("movies:~u:title", "aliens").await.unwrap().is_none());
        repo.create(doc(json!({"_id": "e", "title": "Aliens"}))).await.unwrap();
    }

    #[tokio::test]
    async fn update_racing_an_update_is_contended() {
        let (store, repo) = seeded_interleaving(rename_a_to_aliens()).await;

        let err = repo
            .update(doc(json!({"_id": "a", "title": "Alien 3", "genre": "Horror"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Contended { .. }));
        assert_eq!(repo.get_by_id("a").await.unwrap()["title"], json!("Aliens"));
        assert!(store.hget("movies:~u:title", "alien 3").await.unwrap().is_none());

        repo.update(doc(json!({"_id": "a", "title": "Alien 3", "genre": "Horror"})))
            .await
            .unwrap();
        assert!(store.hget("movies:~u:title", "aliens").await.unwrap().is_none());
        assert_eq!(
            store.hget("movies:~u:title", "alien 3").await.unwrap().as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn merged_writes_commit_together() {
        let (store, repo) = setup();
        seed(&repo).await;

        let write: PreparedWrite = vec![
            repo.prepare_delete(vec!["a".into(), "nope".into()]).await.unwrap(),
            repo.prepare_update(vec![doc(json!({"_id": "b", "title": "Blade"}))])
                .await
                .unwrap(),
            repo.prepare_delete(vec!["c".into()]).await.unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(write.commit(&*store).await.unwrap(), 3);
        assert_eq!(repo.order(None).await.unwrap(), vec!["b"]);
        assert_eq!(repo.get_by_id("b").await.unwrap()["title"], json!("Blade"));
    }
}
