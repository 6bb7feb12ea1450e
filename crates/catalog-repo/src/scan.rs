//! Cursor-driven exhaustive iteration over the keyspace and over hashes.
//!
//! Store scans may repeat keys, so results are collected into sorted sets.

use std::collections::{BTreeMap, BTreeSet};

use catalog_store::{KvStore, StoreResult};

/// Collect every key matching `pattern`.
pub async fn scan_keys(store: &dyn KvStore, pattern: &str, batch: usize) -> StoreResult<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    let mut cursor = 0;
    let mut round_trips = 0usize;
    loop {
        let page = store.scan(cursor, pattern, batch).await?;
        keys.extend(page.items);
        round_trips += 1;
        cursor = page.cursor;
        if cursor == 0 {
            break;
        }
    }
    tracing::trace!(pattern, round_trips, found = keys.len(), "keyspace scan");
    Ok(keys)
}

/// Collect every `(field, value)` of the hash at `key` whose field matches.
pub async fn scan_hash(
    store: &dyn KvStore,
    key: &str,
    pattern: &str,
    batch: usize,
) -> StoreResult<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    let mut cursor = 0;
    loop {
        let page = store.hscan(key, cursor, pattern, batch).await?;
        entries.extend(page.items);
        cursor = page.cursor;
        if cursor == 0 {
            break;
        }
    }
    tracing::trace!(key, pattern, found = entries.len(), "hash scan");
    Ok(entries)
}
