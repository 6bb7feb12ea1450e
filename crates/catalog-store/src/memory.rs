use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::{Command, Guard, Reply, ScanPage, Transaction, TxOutcome};
use crate::error::{StoreError, StoreResult};
use crate::glob::glob_match;
use crate::traits::KvStore;

/// Scan page size used when a caller passes a zero `count` hint.
const DEFAULT_SCAN_COUNT: usize = 10;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Abandoned scans beyond this many are forgotten, oldest first.
const MAX_OPEN_CURSORS: usize = 1024;

/// A typed value held under one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    String(String),
    List(Vec<String>),
    Hash(BTreeMap<String, String>),
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Hash(_) => "hash",
        }
    }
}

/// Serializable point-in-time copy of the whole keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub entries: BTreeMap<String, StoredValue>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Open scan iterations: cursor to the last key or field examined.
#[derive(Debug, Default)]
struct CursorTable {
    last_issued: u64,
    open: BTreeMap<u64, String>,
}

impl CursorTable {
    fn open(&mut self, last: String) -> u64 {
        self.last_issued = self.last_issued.checked_add(1).unwrap_or(1);
        if self.open.len() >= MAX_OPEN_CURSORS {
            self.open.pop_first();
        }
        self.open.insert(self.last_issued, last);
        self.last_issued
    }

    /// The key to resume after; `None` starts from the beginning.
    fn resume(&mut self, cursor: u64) -> StoreResult<Option<String>> {
        if cursor == 0 {
            return Ok(None);
        }
        self.open
            .remove(&cursor)
            .map(Some)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown scan cursor {cursor}")))
    }
}

fn after(last: &Option<String>) -> (Bound<&String>, Bound<&String>) {
    match last {
        None => (Bound::Unbounded, Bound::Unbounded),
        Some(last) => (Bound::Excluded(last), Bound::Unbounded),
    }
}

/// In-memory, BTreeMap-based key-value store.
///
/// Intended for tests, embedding, and the maintenance CLI. The keyspace is
/// held behind a `RwLock`; transactions take the write lock for their whole
/// guard-check and apply step, which makes them atomic with respect to every
/// other call. Keys iterate in sorted order and a scan cursor remembers the
/// last key it examined, so deletes behind the cursor never hide later keys.
pub struct InMemoryKvStore {
    keyspace: RwLock<BTreeMap<String, StoredValue>>,
    cursors: Mutex<CursorTable>,
}

impl InMemoryKvStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            keyspace: RwLock::new(BTreeMap::new()),
            cursors: Mutex::new(CursorTable::default()),
        }
    }

    /// Create a store pre-populated from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            keyspace: RwLock::new(snapshot.entries),
            cursors: Mutex::new(CursorTable::default()),
        }
    }

    /// Copy the current keyspace into a snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            entries: self.keyspace.read().expect("lock poisoned").clone(),
        }
    }

    /// Load a JSON snapshot file. A missing file yields an empty store.
    pub async fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                tracing::debug!(path = %path.display(), keys = snapshot.entries.len(), "loaded snapshot");
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the keyspace to a JSON snapshot file.
    ///
    /// The snapshot is written to a sibling temp file and renamed over the
    /// target, so readers never observe a half-written file.
    pub async fn save(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "saved snapshot");
        Ok(())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.keyspace.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.keyspace.read().expect("lock poisoned").is_empty()
    }

    /// Remove all keys from the store.
    pub fn clear(&self) {
        self.keyspace.write().expect("lock poisoned").clear();
    }

    /// Return the sorted list of all keys.
    pub fn keys(&self) -> Vec<String> {
        self.keyspace
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryKvStore")
            .field("key_count", &count)
            .finish()
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &StoredValue) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

fn string_at<'a>(map: &'a BTreeMap<String, StoredValue>, key: &str) -> StoreResult<Option<&'a String>> {
    match map.get(key) {
        None => Ok(None),
        Some(StoredValue::String(s)) => Ok(Some(s)),
        Some(other) => Err(wrong_type(key, "string", other)),
    }
}

fn hash_at<'a>(
    map: &'a BTreeMap<String, StoredValue>,
    key: &str,
) -> StoreResult<Option<&'a BTreeMap<String, String>>> {
    match map.get(key) {
        None => Ok(None),
        Some(StoredValue::Hash(h)) => Ok(Some(h)),
        Some(other) => Err(wrong_type(key, "hash", other)),
    }
}

/// Resolve Redis-style inclusive range bounds against a list length.
fn list_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn check_guard(map: &BTreeMap<String, StoredValue>, guard: &Guard) -> StoreResult<bool> {
    match guard {
        Guard::KeyAbsent { key } => Ok(!map.contains_key(key)),
        Guard::KeyPresent { key } => Ok(map.contains_key(key)),
        Guard::FieldFree { key, field, owners } => Ok(match hash_at(map, key)?.and_then(|h| h.get(field)) {
            None => true,
            Some(holder) => owners.iter().any(|o| o == holder),
        }),
        Guard::ValueEquals { key, value } => Ok(string_at(map, key)?.is_some_and(|v| v == value)),
        Guard::ListEquals { key, values } => Ok(match map.get(key) {
            None => values.is_empty(),
            Some(StoredValue::List(list)) => list == values,
            Some(other) => return Err(wrong_type(key, "list", other)),
        }),
    }
}

fn apply(map: &mut BTreeMap<String, StoredValue>, command: &Command) -> StoreResult<Reply> {
    match command {
        Command::Set { key, value } => {
            map.insert(key.clone(), StoredValue::String(value.clone()));
            Ok(Reply::Ok)
        }
        Command::Del { key } => Ok(Reply::Integer(i64::from(map.remove(key).is_some()))),
        Command::RPush { key, values } => {
            if values.is_empty() {
                return match map.get(key) {
                    None => Ok(Reply::Integer(0)),
                    Some(StoredValue::List(list)) => Ok(Reply::Integer(list.len() as i64)),
                    Some(other) => Err(wrong_type(key, "list", other)),
                };
            }
            match map
                .entry(key.clone())
                .or_insert_with(|| StoredValue::List(Vec::new()))
            {
                StoredValue::List(list) => {
                    list.extend(values.iter().cloned());
                    Ok(Reply::Integer(list.len() as i64))
                }
                other => Err(wrong_type(key, "list", other)),
            }
        }
        Command::LRem { key, count, value } => {
            let list = match map.get_mut(key) {
                None => return Ok(Reply::Integer(0)),
                Some(StoredValue::List(list)) => list,
                Some(other) => return Err(wrong_type(key, "list", other)),
            };
            let limit = if *count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
            let mut removed = 0usize;
            if *count >= 0 {
                list.retain(|item| {
                    if removed < limit && item == value {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
            } else {
                let mut kept: Vec<String> = Vec::with_capacity(list.len());
                for item in list.drain(..).rev() {
                    if removed < limit && item == *value {
                        removed += 1;
                    } else {
                        kept.push(item);
                    }
                }
                kept.reverse();
                *list = kept;
            }
            if list.is_empty() {
                map.remove(key);
            }
            Ok(Reply::Integer(removed as i64))
        }
        Command::HSet { key, field, value } => {
            let entry = map
                .entry(key.clone())
                .or_insert_with(|| StoredValue::Hash(BTreeMap::new()));
            match entry {
                StoredValue::Hash(hash) => {
                    let added = hash.insert(field.clone(), value.clone()).is_none();
                    Ok(Reply::Integer(i64::from(added)))
                }
                other => Err(wrong_type(key, "hash", other)),
            }
        }
        Command::HDel { key, field } => {
            let hash = match map.get_mut(key) {
                None => return Ok(Reply::Integer(0)),
                Some(StoredValue::Hash(hash)) => hash,
                Some(other) => return Err(wrong_type(key, "hash", other)),
            };
            let removed = hash.remove(field).is_some();
            if hash.is_empty() {
                map.remove(key);
            }
            Ok(Reply::Integer(i64::from(removed)))
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let map = self.keyspace.read().expect("lock poisoned");
        Ok(string_at(&map, key)?.cloned())
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let map = self.keyspace.read().expect("lock poisoned");
        // MGET reports non-string keys as nil rather than failing.
        Ok(keys
            .iter()
            .map(|key| match map.get(key) {
                Some(StoredValue::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut map = self.keyspace.write().expect("lock poisoned");
        map.insert(key.to_string(), StoredValue::String(value.to_string()));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let mut map = self.keyspace.write().expect("lock poisoned");
        Ok(keys.iter().filter(|key| map.remove(*key).is_some()).count() as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let map = self.keyspace.read().expect("lock poisoned");
        let list = match map.get(key) {
            None => return Ok(Vec::new()),
            Some(StoredValue::List(list)) => list,
            Some(other) => return Err(wrong_type(key, "list", other)),
        };
        Ok(match list_bounds(list.len(), start, stop) {
            Some((from, to)) => list[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let map = self.keyspace.read().expect("lock poisoned");
        Ok(hash_at(&map, key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let map = self.keyspace.read().expect("lock poisoned");
        let hash = hash_at(&map, key)?;
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        let map = self.keyspace.read().expect("lock poisoned");
        Ok(hash_at(&map, key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage<String>> {
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };
        let resume = self.cursors.lock().expect("lock poisoned").resume(cursor)?;
        let (items, last) = {
            let map = self.keyspace.read().expect("lock poisoned");
            let window: Vec<&String> = map
                .range::<String, _>(after(&resume))
                .take(count + 1)
                .map(|(key, _)| key)
                .collect();
            let examined = &window[..window.len().min(count)];
            let items: Vec<String> = examined
                .iter()
                .filter(|key| glob_match(pattern, key.as_str()))
                .map(|key| (*key).clone())
                .collect();
            let last = (window.len() > count)
                .then(|| examined.last().map(|key| (*key).clone()))
                .flatten();
            (items, last)
        };
        let cursor = match last {
            Some(last) => self.cursors.lock().expect("lock poisoned").open(last),
            None => 0,
        };
        Ok(ScanPage { cursor, items })
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StoreResult<ScanPage<(String, String)>> {
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };
        let resume = self.cursors.lock().expect("lock poisoned").resume(cursor)?;
        let (items, last) = {
            let map = self.keyspace.read().expect("lock poisoned");
            let Some(hash) = hash_at(&map, key)? else {
                return Ok(ScanPage {
                    cursor: 0,
                    items: Vec::new(),
                });
            };
            let window: Vec<(&String, &String)> = hash
                .range::<String, _>(after(&resume))
                .take(count + 1)
                .collect();
            let examined = &window[..window.len().min(count)];
            let items: Vec<(String, String)> = examined
                .iter()
                .filter(|(field, _)| glob_match(pattern, field))
                .map(|(field, value)| ((*field).clone(), (*value).clone()))
                .collect();
            let last = (window.len() > count)
                .then(|| examined.last().map(|(field, _)| (*field).clone()))
                .flatten();
            (items, last)
        };
        let cursor = match last {
            Some(last) => self.cursors.lock().expect("lock poisoned").open(last),
            None => 0,
        };
        Ok(ScanPage { cursor, items })
    }

    async fn exec(&self, tx: Transaction) -> StoreResult<TxOutcome> {
        let mut map = self.keyspace.write().expect("lock poisoned");

        for (index, guard) in tx.guards.iter().enumerate() {
            if !check_guard(&map, guard)? {
                tracing::debug!(index, ?guard, "transaction guard failed");
                return Ok(TxOutcome::Aborted { guard: index });
            }
        }

        // Keep the pre-transaction value of every touched key so a failing
        // command can roll the keyspace back.
        let mut undo: Vec<(String, Option<StoredValue>)> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();
        let mut replies = Vec::with_capacity(tx.commands.len());

        for command in &tx.commands {
            let key = command.key();
            if touched.insert(key.to_string()) {
                undo.push((key.to_string(), map.get(key).cloned()));
            }
            match apply(&mut map, command) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    for (key, previous) in undo.into_iter().rev() {
                        match previous {
                            Some(value) => map.insert(key, value),
                            None => map.remove(&key),
                        };
                    }
                    return Err(e);
                }
            }
        }

        Ok(TxOutcome::Committed(replies))
    }

    async fn exists(&self, keys: &[String]) -> StoreResult<Vec<bool>> {
        let map = self.keyspace.read().expect("lock poisoned");
        Ok(keys.iter().map(|key| map.contains_key(key)).collect())
    }
}
