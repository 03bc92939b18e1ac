//! LMDB-backed store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to persist cache payloads
//! across process restarts.
//!
//! # Format
//!
//! Keys are the UTF-8 bytes of the cache key. Values are JSON-encoded.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get` and `get_many`
//! - One write transaction per `set`, `delete`, `set_many` and `delete_many`
//! - Statistics are tracked behind a lock

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use serde_json::Value;
use tether_core::{StoreError, TetherError};

use super::traits::{KeyValueStore, StoreResult, StoreStats};

/// Error type for LMDB environment setup.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        StoreError::Backend {
            reason: e.to_string(),
        }
    }
}

impl From<LmdbStoreError> for TetherError {
    fn from(e: LmdbStoreError) -> Self {
        TetherError::Store(e.into())
    }
}

/// Persistent store on LMDB.
///
/// # Example
///
/// ```ignore
/// use tether_storage::LmdbStore;
///
/// let store = LmdbStore::open("/var/cache/app", 64)?;
/// let layer = CacheLayer::new(store, CacheConfig::default());
/// ```
pub struct LmdbStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Usage statistics.
    stats: RwLock<StoreStats>,
}

impl LmdbStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let entry_count = {
            let rtxn = env
                .read_txn()
                .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
            db.len(&rtxn)
                .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?
        };

        Ok(Self {
            env,
            db,
            stats: RwLock::new(StoreStats {
                entry_count,
                ..StoreStats::default()
            }),
        })
    }

    fn read_one(&self, rtxn: &RoTxn<'_>, key: &str) -> StoreResult<Option<Value>> {
        let bytes = self
            .db
            .get(rtxn, key.as_bytes())
            .map_err(|e| StoreError::ReadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let value = match bytes {
            Some(bytes) => Some(serde_json::from_slice(bytes).map_err(|e| {
                StoreError::InvalidPayload {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        if let Ok(mut stats) = self.stats.write() {
            if value.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
        Ok(value)
    }

    fn read_txn(&self, key: &str) -> StoreResult<RoTxn<'_>> {
        self.env.read_txn().map_err(|e| StoreError::ReadFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn refresh_entry_count(&self) {
        let count = self
            .env
            .read_txn()
            .ok()
            .and_then(|rtxn| self.db.len(&rtxn).ok());
        if let (Some(count), Ok(mut stats)) = (count, self.stats.write()) {
            stats.entry_count = count;
        }
    }

    fn write_entries(&self, entries: &[(String, Value)]) -> StoreResult<()> {
        let first_key = entries.first().map(|(k, _)| k.as_str()).unwrap_or_default();
        let write_failed = |key: &str, e: heed::Error| StoreError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let mut wtxn = self.env.write_txn().map_err(|e| write_failed(first_key, e))?;
        for (key, value) in entries {
            let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            self.db
                .put(&mut wtxn, key.as_bytes(), &bytes)
                .map_err(|e| write_failed(key, e))?;
        }
        wtxn.commit().map_err(|e| write_failed(first_key, e))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.writes += entries.len() as u64;
        }
        self.refresh_entry_count();
        Ok(())
    }

    fn delete_keys(&self, keys: &[String]) -> StoreResult<()> {
        let first_key = keys.first().map(String::as_str).unwrap_or_default();
        let delete_failed = |key: &str, e: heed::Error| StoreError::DeleteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| delete_failed(first_key, e))?;
        for key in keys {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(|e| delete_failed(key, e))?;
        }
        wtxn.commit().map_err(|e| delete_failed(first_key, e))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.deletes += keys.len() as u64;
        }
        self.refresh_entry_count();
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for LmdbStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let rtxn = self.read_txn(key)?;
        self.read_one(&rtxn, key)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        let first_key = keys.first().map(String::as_str).unwrap_or_default();
        let rtxn = self.read_txn(first_key)?;
        keys.iter().map(|key| self.read_one(&rtxn, key)).collect()
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.write_entries(&[(key.to_string(), value)])
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write_entries(&entries)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.delete_keys(&[key.to_string()])
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.delete_keys(keys)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}
