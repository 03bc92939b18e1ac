//! tether Storage - Stores and Cache Adapters
//!
//! Key-value stores (in-memory and LMDB) and the cache adapters that keep
//! them in sync with tether records and groups.

pub mod cache;
pub mod store;

pub use cache::{
    derive_key, CacheKey, CacheLayer, GroupCache, GroupRestore, KeyedWriteQueue, RecordCache,
    RecordWrite, Rehydration, Rehydrator, RestoreOutcome, StoreBinding,
};
pub use store::{InMemoryStore, KeyValueStore, LmdbStore, LmdbStoreError, StoreResult, StoreStats};
