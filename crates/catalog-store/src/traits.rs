use async_trait::async_trait;

use crate::command::{ScanPage, Transaction, TxOutcome};
use crate::error::StoreResult;

/// Key-value store protocol consumed by the repository layer.
///
/// All implementations must satisfy these invariants:
/// - Single-key commands are atomic.
/// - Batched reads (`mget`, `hmget`) observe each key atomically but make no
///   promise across keys.
/// - [`exec`](Self::exec) checks every guard and applies every command as one
///   unit. No other writer observes or interleaves with a partial application.
/// - Scans return every key present for the whole iteration at least once,
///   and may return a key more than once.
/// - The store never interprets values; it is a pure key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a string key. Returns `Ok(None)` if the key does not exist.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Read many string keys in one round-trip, in request order.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Set a string key outside of a transaction.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete keys of any type. Returns how many existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Read list elements between `start` and `stop` inclusive. Negative
    /// indices count from the tail, so `(0, -1)` reads the whole list.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Read a single hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Read many fields from one hash in one round-trip, in request order.
    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// List the fields of a hash. A missing key yields an empty list.
    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Iterate the keyspace. Start with cursor `0`; iteration is complete
    /// when the returned cursor is `0` again. `count` is a hint for how many
    /// keys one call examines. Deleting keys mid-iteration never hides keys
    /// still present.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage<String>>;

    /// Iterate a hash's fields matching `pattern`, yielding `(field, value)`.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StoreResult<ScanPage<(String, String)>>;

    /// Execute a guarded transaction atomically.
    async fn exec(&self, tx: Transaction) -> StoreResult<TxOutcome>;

    /// Check whether each key exists, in request order.
    ///
    /// Default implementation piggybacks on `mget`, which is only correct
    /// for string keys. Backends may override it for mixed key types.
    async fn exists(&self, keys: &[String]) -> StoreResult<Vec<bool>> {
        Ok(self
            .mget(keys)
            .await?
            .into_iter()
            .map(|value| value.is_some())
            .collect())
    }
}
