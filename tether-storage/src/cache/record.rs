//! Write-through cache adapter for a single record.

use std::sync::Arc;

use tether_core::{
    CacheOptions, Cacheable, ConfigError, Mutation, Record, RecordEvent, TetherError,
    TetherResult,
};

use super::key::CacheKey;
use super::layer::CacheLayer;
use crate::store::KeyValueStore;

/// What a restore did to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The cached payload was merged into the entity.
    Applied,
    /// Nothing was cached under the key; the entity is unchanged.
    Absent,
    /// The entity was destroyed while the read was in flight; the payload
    /// was dropped.
    Discarded,
}

/// Result of [`RecordCache::cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    /// Key the payload was written under.
    pub key: CacheKey,
    /// Failure of the owning group's index write, which does not fail the
    /// record write.
    pub index_error: Option<TetherError>,
}

/// Cache adapter for one record.
///
/// Enable state lives on the record itself, so any number of adapters for
/// the same record agree on it.
pub struct RecordCache<S> {
    layer: CacheLayer<S>,
    record: Arc<Record>,
}

impl<S> RecordCache<S>
where
    S: KeyValueStore + 'static,
{
    pub(crate) fn new(layer: CacheLayer<S>, record: Arc<Record>) -> Self {
        Self { layer, record }
    }

    pub fn record(&self) -> &Arc<Record> {
        &self.record
    }

    /// The record's current cache key.
    pub fn key(&self) -> Result<CacheKey, ConfigError> {
        self.layer.key_for(&*self.record)
    }

    pub fn is_enabled(&self) -> bool {
        self.record.cache_state().is_enabled()
    }

    /// Start writing the record through on every fetch, save and local edit,
    /// and evicting it on delete.
    ///
    /// Returns `false` if caching was already enabled; nothing changes in
    /// that case.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingKeySource`] when the record has no key source.
    pub fn enable(&self, options: CacheOptions) -> TetherResult<bool> {
        if self.record.key_source().is_none() {
            return Err(ConfigError::MissingKeySource {
                kind: self.record.kind().to_string(),
            }
            .into());
        }
        if !self.record.cache_state().try_enable(options) {
            return Ok(false);
        }

        let layer = self.layer.clone();
        let weak = Arc::downgrade(&self.record);
        let subscription = self.record.events().subscribe(move |event| {
            let layer = layer.clone();
            let weak = weak.clone();
            async move {
                let Some(record) = weak.upgrade() else {
                    return Ok(());
                };
                let cache = layer.record(&record);
                match event {
                    RecordEvent::Fetched | RecordEvent::Saved | RecordEvent::Changed => {
                        cache.write_through().await
                    }
                    RecordEvent::Deleted => cache.evict().await,
                }
            }
        });
        self.record.cache_state().attach([subscription]);

        tracing::debug!(
            kind = self.record.kind(),
            id = ?self.record.id(),
            "Enabled record cache"
        );
        Ok(true)
    }

    /// Write the record's attributes, and the owning group's index when that
    /// group is cache-enabled.
    ///
    /// The two writes are issued together. The index write is best-effort:
    /// its failure is logged and reported in [`RecordWrite::index_error`].
    pub async fn cache(&self) -> TetherResult<RecordWrite> {
        let key = self.key()?;
        let owner = self
            .record
            .owner()
            .filter(|group| group.cache_state().is_enabled());

        let Some(group) = owner else {
            self.layer.write_record(&self.record, key.clone()).await?;
            return Ok(RecordWrite {
                key,
                index_error: None,
            });
        };

        let index = self.layer.group(&group);
        let (payload, index) = futures::join!(
            self.layer.write_record(&self.record, key.clone()),
            index.cache()
        );
        payload?;

        let index_error = index.err();
        if let Some(e) = &index_error {
            tracing::warn!(key = %key, error = %e, "Group index write failed");
        }
        Ok(RecordWrite { key, index_error })
    }

    /// Write only the record's attributes.
    pub async fn cache_payload(&self) -> TetherResult<CacheKey> {
        let key = self.key()?;
        self.layer.write_record(&self.record, key.clone()).await?;
        Ok(key)
    }

    /// Event-driven write. A record without an identifier has no slot yet,
    /// so there is nothing to write.
    async fn write_through(&self) -> TetherResult<()> {
        match self.cache().await {
            Ok(_) => Ok(()),
            Err(TetherError::Config(ConfigError::UnresolvedKey { .. })) if self.record.is_new() => {
                tracing::trace!(kind = self.record.kind(), "Skipping write for unsaved record");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the subscriptions installed by [`enable`](Self::enable), mark
    /// the record disabled, then delete its payload.
    pub async fn evict(&self) -> TetherResult<()> {
        for subscription in self.record.cache_state().disable() {
            self.record.events().unsubscribe(subscription);
        }

        let key = match self.key() {
            Ok(key) => key,
            Err(ConfigError::UnresolvedKey { .. }) if self.record.is_new() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.layer.remove(key).await?;
        Ok(())
    }

    /// Merge the cached payload into the record without marking anything as
    /// changed by the user.
    pub async fn restore(&self) -> TetherResult<RestoreOutcome> {
        let key = self.key()?;
        let cached = self.layer.binding().read_attributes(&key).await?;

        if !self.record.is_live() {
            tracing::warn!(key = %key, "Record destroyed during restore, discarding payload");
            return Ok(RestoreOutcome::Discarded);
        }

        match cached {
            Some(attributes) => {
                self.record.set(attributes, Mutation::Silent);
                Ok(RestoreOutcome::Applied)
            }
            None => {
                tracing::debug!(key = %key, "Nothing cached for record");
                Ok(RestoreOutcome::Absent)
            }
        }
    }
}

impl<S> std::fmt::Debug for RecordCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("record", &self.record)
            .finish()
    }
}
