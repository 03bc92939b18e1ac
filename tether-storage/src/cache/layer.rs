//! Cache layer entry point.

use std::collections::HashSet;
use std::sync::Arc;

use tether_core::{CacheConfig, Cacheable, ConfigError, Group, Record};

use super::binding::StoreBinding;
use super::group::GroupCache;
use super::key::{derive_key, CacheKey};
use super::record::RecordCache;
use super::rehydrate::Rehydrator;
use super::write_queue::KeyedWriteQueue;
use crate::store::{KeyValueStore, StoreResult};

struct LayerInner<S> {
    binding: StoreBinding<S>,
    config: CacheConfig,
    queue: KeyedWriteQueue,
}

/// Shared state of the write-through cache: the store binding, the
/// process-wide configuration and the per-key write queue.
///
/// Cheap to clone. Adapters handed out by [`record`](Self::record),
/// [`group`](Self::group) and [`rehydrator`](Self::rehydrator) all share
/// the same queue, so writes for one key are serialized no matter which
/// adapter issues them.
///
/// # Example
///
/// ```ignore
/// let layer = CacheLayer::new(InMemoryStore::new(), CacheConfig::default());
///
/// let todos = layer.group(&group);
/// todos.enable(CacheOptions::default())?;
/// todos.restore().await?;
/// ```
pub struct CacheLayer<S> {
    inner: Arc<LayerInner<S>>,
}

impl<S> CacheLayer<S>
where
    S: KeyValueStore + 'static,
{
    pub fn new(store: S, config: CacheConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Create a layer with the default configuration.
    pub fn with_defaults(store: S) -> Self {
        Self::new(store, CacheConfig::default())
    }

    /// Create a layer over a store that is also used elsewhere.
    pub fn from_shared(store: Arc<S>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(LayerInner {
                binding: StoreBinding::new(store),
                config,
                queue: KeyedWriteQueue::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        self.inner.binding.store()
    }

    pub fn binding(&self) -> &StoreBinding<S> {
        &self.inner.binding
    }

    pub fn queue(&self) -> &KeyedWriteQueue {
        &self.inner.queue
    }

    /// Derive the current key of any cacheable entity.
    pub fn key_for<E>(&self, entity: &E) -> Result<CacheKey, ConfigError>
    where
        E: Cacheable + ?Sized,
    {
        derive_key(entity, &self.inner.config)
    }

    pub fn record(&self, record: &Arc<Record>) -> RecordCache<S> {
        RecordCache::new(self.clone(), Arc::clone(record))
    }

    pub fn group(&self, group: &Arc<Group>) -> GroupCache<S> {
        GroupCache::new(self.clone(), Arc::clone(group))
    }

    pub fn rehydrator(&self) -> Rehydrator<S> {
        Rehydrator::new(self.clone())
    }

    /// Queue a write of the record's attributes under `key`.
    ///
    /// Attributes are snapshotted when the write starts, not when it is
    /// queued.
    pub(crate) async fn write_record(&self, record: &Arc<Record>, key: CacheKey) -> StoreResult<()> {
        let layer = self.clone();
        let record = Arc::clone(record);
        let job_key = key.clone();
        self.inner
            .queue
            .run(key.as_str(), move || async move {
                let attributes = record.attributes();
                layer.binding().write_attributes(&job_key, attributes).await
            })
            .await
    }

    /// Queue a write of the group's member index under `key`.
    ///
    /// The index is computed when the write starts.
    pub(crate) async fn write_index(&self, group: &Arc<Group>, key: CacheKey) -> StoreResult<()> {
        let layer = self.clone();
        let group = Arc::clone(group);
        let job_key = key.clone();
        self.inner
            .queue
            .run(key.as_str(), move || async move {
                let members = layer.index_keys(&group);
                layer.binding().write_index(&job_key, members).await
            })
            .await
    }

    /// Queue removal of `key`.
    pub(crate) async fn remove(&self, key: CacheKey) -> StoreResult<()> {
        let layer = self.clone();
        let job_key = key.clone();
        self.inner
            .queue
            .run(key.as_str(), move || async move {
                layer.binding().remove(&job_key).await
            })
            .await
    }

    /// Ordered, de-duplicated keys of the group's persisted members.
    pub(crate) fn index_keys(&self, group: &Group) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for member in group.members() {
            if !is_persisted(&member) {
                continue;
            }
            match self.key_for(&*member) {
                Ok(key) => {
                    let key = key.into_string();
                    if seen.insert(key.clone()) {
                        keys.push(key);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        kind = member.kind(),
                        "Leaving member out of group index"
                    );
                }
            }
        }
        keys
    }
}

impl<S> CacheLayer<S> {
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

/// A record has a slot in the store once it has an id, or when it was
/// restored from a key it cannot derive itself.
pub(crate) fn is_persisted(record: &Record) -> bool {
    !record.is_new() || record.pinned_key().is_some()
}

impl<S> Clone for CacheLayer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for CacheLayer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("config", &self.inner.config)
            .field("queue", &self.inner.queue)
            .finish()
    }
}
