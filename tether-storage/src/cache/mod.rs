//! Write-through / read-through cache for records and groups.
//!
//! The remote sync source emits lifecycle events on records and groups.
//! Cache adapters subscribe to them and write through the
//! [`StoreBinding`]; on start-up the [`Rehydrator`] reads through the same
//! binding to rebuild records and groups before, or instead of, a network
//! fetch.
//!
//! # Consistency
//!
//! In-memory entities are authoritative; the cache is eventually
//! consistent. Writes are serialized per key by the [`KeyedWriteQueue`],
//! and a write snapshots entity state when it starts, so a burst of
//! events lands as the latest state rather than an intermediate one.
//!
//! # Example
//!
//! ```ignore
//! let layer = CacheLayer::new(LmdbStore::open(path, 64)?, CacheConfig::from_env()?);
//!
//! let todos = layer.group(&group);
//! todos.enable(CacheOptions::default())?;
//!
//! // Render the last-known state first...
//! let restored = todos.restore().await?;
//! if !restored.is_complete() {
//!     tracing::warn!(missing = ?restored.rehydration.missing, "Some todos were not cached");
//! }
//! // ...then let the remote fetch overwrite it.
//! ```

pub mod binding;
pub mod group;
pub mod key;
pub mod layer;
pub mod record;
pub mod rehydrate;
pub mod write_queue;

pub use binding::{payload_to_attributes, StoreBinding};
pub use group::{sanitize_index, GroupCache, GroupRestore};
pub use key::{derive_key, CacheKey};
pub use layer::CacheLayer;
pub use record::{RecordCache, RecordWrite, RestoreOutcome};
pub use rehydrate::{Rehydration, Rehydrator};
pub use write_queue::KeyedWriteQueue;

use tether_core::TetherResult;

/// Return the first error of a set of concurrently issued operations,
/// logging the rest.
pub(crate) fn first_error<I>(results: I) -> TetherResult<()>
where
    I: IntoIterator<Item = TetherResult<()>>,
{
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            if first.is_none() {
                first = Some(e);
            } else {
                tracing::warn!(error = %e, "Additional cache operation failure");
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
