//! Key-value stores the cache layer writes through to.

pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use lmdb_backend::{LmdbStore, LmdbStoreError};
pub use memory::InMemoryStore;
pub use traits::{KeyValueStore, StoreResult, StoreStats};
