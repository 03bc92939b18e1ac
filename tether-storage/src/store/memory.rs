//! In-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::traits::{KeyValueStore, StoreResult, StoreStats};

/// A `HashMap` behind an async lock.
///
/// The default store for tests and for processes that only need a cache
/// for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            entries: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Copy of every stored entry.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.read().await.clone()
    }

    /// Read a value without touching the statistics.
    pub async fn peek(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn record_read(&self, found: bool) {
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let value = self.entries.read().await.get(key).cloned();
        self.record_read(value.is_some());
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        let entries = self.entries.read().await;
        let values = keys
            .iter()
            .map(|key| {
                let value = entries.get(key).cloned();
                self.record_read(value.is_some());
                value
            })
            .collect();
        Ok(values)
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        let count = entries.len() as u64;
        self.entries.write().await.extend(entries);
        self.writes.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        self.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            entry_count: self.entries.read().await.len() as u64,
        })
    }
}
