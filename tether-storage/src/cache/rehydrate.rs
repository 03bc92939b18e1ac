//! Rebuilding records from stored keys.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tether_core::{Record, RecordFactory, RehydrationError, RehydrationStrategy, TetherError};

use super::binding::payload_to_attributes;
use super::layer::CacheLayer;
use super::record::RestoreOutcome;
use crate::store::KeyValueStore;

/// Records rebuilt from a list of keys.
///
/// `records` follows the order of the input keys with failed and missing
/// slots left out.
#[derive(Debug, Default)]
pub struct Rehydration {
    pub records: Vec<Arc<Record>>,
    /// Keys with nothing stored under them.
    pub missing: Vec<String>,
    /// Keys whose read or payload failed.
    pub failed: Vec<(String, TetherError)>,
}

impl Rehydration {
    pub fn restored(&self) -> usize {
        self.records.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Treat any missing or failed slot as an error.
    pub fn into_result(self) -> Result<Vec<Arc<Record>>, RehydrationError> {
        if self.is_complete() {
            return Ok(self.records);
        }
        Err(RehydrationError::Partial {
            restored: self.records.len(),
            failed: self.failed_keys(),
            missing: self.missing,
        })
    }
}

enum Slot {
    Restored(Arc<Record>),
    Missing(String),
    Failed(String, TetherError),
}

/// Rebuilds records from cache keys using the configured
/// [`RehydrationStrategy`].
pub struct Rehydrator<S> {
    layer: CacheLayer<S>,
}

impl<S> Rehydrator<S>
where
    S: KeyValueStore + 'static,
{
    pub(crate) fn new(layer: CacheLayer<S>) -> Self {
        Self { layer }
    }

    pub fn strategy(&self) -> RehydrationStrategy {
        self.layer.config().rehydration
    }

    /// Build one record per key, in key order.
    ///
    /// A key that is absent or fails yields no record; the rest of the batch
    /// still completes.
    pub async fn rehydrate(&self, keys: &[String], factory: &dyn RecordFactory) -> Rehydration {
        if keys.is_empty() {
            return Rehydration::default();
        }

        let slots = match self.strategy() {
            RehydrationStrategy::Batched => self.batched(keys, factory).await,
            RehydrationStrategy::PerKey { max_concurrency } => {
                self.per_key(keys, factory, max_concurrency).await
            }
        };

        let mut rehydration = Rehydration::default();
        for slot in slots {
            match slot {
                Slot::Restored(record) => rehydration.records.push(record),
                Slot::Missing(key) => rehydration.missing.push(key),
                Slot::Failed(key, error) => rehydration.failed.push((key, error)),
            }
        }

        if !rehydration.is_complete() {
            tracing::warn!(
                restored = rehydration.restored(),
                missing = rehydration.missing.len(),
                failed = rehydration.failed.len(),
                "Partial rehydration"
            );
        }
        rehydration
    }

    async fn batched(&self, keys: &[String], factory: &dyn RecordFactory) -> Vec<Slot> {
        let values = match self.layer.binding().read_many(keys).await {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(error = %e, "Batched read failed, falling back to per-key reads");
                return self.per_key(keys, factory, None).await;
            }
        };

        keys.iter()
            .zip(values)
            .map(|(key, value)| match value {
                None => Slot::Missing(key.clone()),
                Some(value) => match payload_to_attributes(key, value) {
                    Ok(attributes) => {
                        let record = factory.create(attributes);
                        if record.is_new() {
                            record.pin_key(key.as_str());
                        }
                        Slot::Restored(record)
                    }
                    Err(e) => Slot::Failed(key.clone(), e.into()),
                },
            })
            .collect()
    }

    async fn per_key(
        &self,
        keys: &[String],
        factory: &dyn RecordFactory,
        max_concurrency: Option<usize>,
    ) -> Vec<Slot> {
        let restores = keys.iter().map(|key| self.restore_slot(key, factory));
        match max_concurrency {
            None => join_all(restores).await,
            Some(limit) => stream::iter(restores).buffered(limit.max(1)).collect().await,
        }
    }

    async fn restore_slot(&self, key: &str, factory: &dyn RecordFactory) -> Slot {
        let record = factory.placeholder(key);
        match self.layer.record(&record).restore().await {
            Ok(RestoreOutcome::Applied) => {
                if !record.is_new() {
                    record.unpin_key();
                }
                Slot::Restored(record)
            }
            Ok(RestoreOutcome::Absent | RestoreOutcome::Discarded) => Slot::Missing(key.to_string()),
            Err(e) => Slot::Failed(key.to_string(), e),
        }
    }
}

impl<S> std::fmt::Debug for Rehydrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rehydrator")
            .field("strategy", &self.layer.config().rehydration)
            .finish()
    }
}
