//! Key-value store trait and statistics.
//!
//! The cache adapters only talk to storage through [`KeyValueStore`]. Any
//! backend (in-memory, LMDB, browser storage behind an FFI boundary, a
//! remote KV service) plugs in by implementing it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Async, fallible key-value store.
///
/// # Contract
///
/// - Values are JSON documents. A record payload is an object, a group
///   index is an array of strings.
/// - `get` returns `Ok(None)` for an absent key; absence is not an error.
/// - `delete` of an absent key succeeds.
/// - Implementations must be safe for concurrent access to distinct keys.
///   Writes to the same key are serialized by the caller.
///
/// The batched operations default to one single-key call per key. Backends
/// that can batch natively should override them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read one value.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Read many values. The result is aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write one value, replacing any previous one.
    async fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Write many values.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    /// Remove one value.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remove many values.
    async fn delete_many(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Usage statistics.
    async fn stats(&self) -> StoreResult<StoreStats>;
}

#[async_trait]
impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        (**self).get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        (**self).get_many(keys).await
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        (**self).set(key, value).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        (**self).set_many(entries).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<()> {
        (**self).delete_many(keys).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        (**self).stats().await
    }
}

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Successful writes.
    pub writes: u64,
    /// Successful deletes (including deletes of absent keys).
    pub deletes: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
