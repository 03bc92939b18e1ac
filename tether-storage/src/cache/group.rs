//! Write-through cache adapter for a group and its members.
//!
//! A group is cached as an index: the ordered keys of its persisted members.
//! Member payloads are written by the members' own adapters. Restoring a
//! group reads the index and rehydrates one record per key.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tether_core::{
    CacheOptions, Cacheable, ConfigError, Group, GroupEvent, Record, RehydrationError,
    TetherResult,
};

use super::first_error;
use super::key::CacheKey;
use super::layer::{is_persisted, CacheLayer};
use super::record::RestoreOutcome;
use super::rehydrate::Rehydration;
use crate::store::KeyValueStore;

/// Result of [`GroupCache::restore`].
#[derive(Debug)]
pub struct GroupRestore {
    pub outcome: RestoreOutcome,
    pub rehydration: Rehydration,
    /// Index entries dropped because they were not non-empty strings or
    /// repeated an earlier entry.
    pub dropped_entries: usize,
}

impl GroupRestore {
    fn absent() -> Self {
        Self {
            outcome: RestoreOutcome::Absent,
            rehydration: Rehydration::default(),
            dropped_entries: 0,
        }
    }

    /// Records restored into the group, in index order.
    pub fn members(&self) -> &[Arc<Record>] {
        &self.rehydration.records
    }

    pub fn is_complete(&self) -> bool {
        self.rehydration.is_complete()
    }

    /// Treat any missing or failed member as an error.
    pub fn into_result(self) -> Result<Vec<Arc<Record>>, RehydrationError> {
        self.rehydration.into_result()
    }
}

/// Cache adapter for one group.
pub struct GroupCache<S> {
    layer: CacheLayer<S>,
    group: Arc<Group>,
}

impl<S> GroupCache<S>
where
    S: KeyValueStore + 'static,
{
    pub(crate) fn new(layer: CacheLayer<S>, group: Arc<Group>) -> Self {
        Self { layer, group }
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// The group's current cache key.
    pub fn key(&self) -> Result<CacheKey, ConfigError> {
        self.layer.key_for(&*self.group)
    }

    pub fn is_enabled(&self) -> bool {
        self.group.cache_state().is_enabled()
    }

    /// Keys the index would hold right now.
    pub fn index_keys(&self) -> Vec<String> {
        self.layer.index_keys(&self.group)
    }

    /// Enable caching for the group and every current member, and keep
    /// members and index in sync as members come and go.
    ///
    /// Members inherit the group's options. Returns `false` if caching was
    /// already enabled.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingKeySource`] when the group, or a member, has no
    /// key source. The group is left disabled in that case.
    pub fn enable(&self, options: CacheOptions) -> TetherResult<bool> {
        if self.group.key_source().is_none() {
            return Err(ConfigError::MissingKeySource {
                kind: self.group.kind().to_string(),
            }
            .into());
        }
        if let Some(member) = self
            .group
            .members()
            .into_iter()
            .find(|member| member.key_source().is_none())
        {
            return Err(ConfigError::MissingKeySource {
                kind: member.kind().to_string(),
            }
            .into());
        }
        if !self.group.cache_state().try_enable(options) {
            return Ok(false);
        }

        for member in self.group.members() {
            self.enable_member(&member)?;
        }

        let layer = self.layer.clone();
        let weak = Arc::downgrade(&self.group);
        let subscription = self.group.events().subscribe(move |event| {
            let layer = layer.clone();
            let weak = weak.clone();
            async move {
                let Some(group) = weak.upgrade() else {
                    return Ok(());
                };
                let cache = layer.group(&group);
                match event {
                    GroupEvent::MemberAdded(member) => cache.on_member_added(member).await,
                    GroupEvent::MemberRemoved(member) => cache.on_member_removed(member).await,
                    GroupEvent::Fetched => cache.on_fetched().await,
                }
            }
        });
        self.group.cache_state().attach([subscription]);

        tracing::debug!(
            kind = self.group.kind(),
            members = self.group.len(),
            "Enabled group cache"
        );
        Ok(true)
    }

    fn enable_member(&self, member: &Arc<Record>) -> TetherResult<bool> {
        let options = self.group.cache_state().options();
        self.layer.record(member).enable(options)
    }

    async fn on_member_added(&self, member: Arc<Record>) -> TetherResult<()> {
        self.enable_member(&member)?;
        if is_persisted(&member) {
            self.layer.record(&member).cache_payload().await?;
        }
        self.cache().await
    }

    async fn on_fetched(&self) -> TetherResult<()> {
        for member in self.group.members() {
            self.enable_member(&member)?;
        }
        self.cache_all().await
    }

    async fn on_member_removed(&self, member: Arc<Record>) -> TetherResult<()> {
        let evicted = self.layer.record(&member).evict().await;
        let indexed = self.cache().await;
        first_error([evicted, indexed])
    }

    /// Write the index: ordered, de-duplicated keys of persisted members.
    /// Member payloads are not written.
    pub async fn cache(&self) -> TetherResult<()> {
        let key = self.key()?;
        self.layer.write_index(&self.group, key).await?;
        Ok(())
    }

    /// Write every persisted member's payload and the index.
    pub async fn cache_all(&self) -> TetherResult<()> {
        let members: Vec<Arc<Record>> = self
            .group
            .members()
            .into_iter()
            .filter(|member| is_persisted(member))
            .collect();

        let payloads = join_all(members.iter().map(|member| {
            let cache = self.layer.record(member);
            async move { cache.cache_payload().await.map(|_| ()) }
        }));
        let (payloads, index) = futures::join!(payloads, self.cache());

        first_error(payloads.into_iter().chain(std::iter::once(index)))
    }

    /// Evict every current member, remove the group's subscriptions, mark it
    /// disabled, then delete the index.
    pub async fn evict(&self) -> TetherResult<()> {
        let members = self.group.members();
        let evictions = join_all(members.iter().map(|member| {
            let cache = self.layer.record(member);
            async move { cache.evict().await }
        }))
        .await;

        for subscription in self.group.cache_state().disable() {
            self.group.events().unsubscribe(subscription);
        }

        let removed: TetherResult<()> = match self.key() {
            Ok(key) => self.layer.remove(key).await.map_err(Into::into),
            Err(e) => Err(e.into()),
        };

        first_error(evictions.into_iter().chain(std::iter::once(removed)))
    }

    /// Rebuild the group's members from the stored index.
    ///
    /// With no index stored the members are left untouched. Otherwise the
    /// member sequence is replaced, silently, by the restored records in
    /// index order. Members that could not be restored are reported in the
    /// result rather than failing the restore.
    pub async fn restore(&self) -> TetherResult<GroupRestore> {
        let key = self.key()?;
        let Some(entries) = self.layer.binding().read_index(&key).await? else {
            tracing::debug!(key = %key, "Nothing cached for group");
            return Ok(GroupRestore::absent());
        };

        let (keys, dropped_entries) = sanitize_index(entries);
        if dropped_entries > 0 {
            tracing::warn!(key = %key, dropped = dropped_entries, "Dropped unusable index entries");
        }

        let factory = self.group.factory();
        let rehydration = self.layer.rehydrator().rehydrate(&keys, &*factory).await;

        if !self.group.is_live() {
            tracing::warn!(key = %key, "Group destroyed during restore, discarding members");
            return Ok(GroupRestore {
                outcome: RestoreOutcome::Discarded,
                rehydration,
                dropped_entries,
            });
        }

        self.group.reset(rehydration.records.clone());
        if self.is_enabled() {
            for member in &rehydration.records {
                self.enable_member(member)?;
            }
        }

        Ok(GroupRestore {
            outcome: RestoreOutcome::Applied,
            rehydration,
            dropped_entries,
        })
    }
}

/// Keep the non-empty string entries of a stored index, first occurrence
/// wins. Returns the keys and how many entries were dropped.
pub fn sanitize_index(entries: Vec<Value>) -> (Vec<String>, usize) {
    let total = entries.len();
    let mut keys: Vec<String> = Vec::with_capacity(total);
    let mut seen: HashSet<String> = HashSet::with_capacity(total);
    for entry in entries {
        if let Value::String(key) = entry {
            if !key.is_empty() && seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }
    let dropped = total - keys.len();
    (keys, dropped)
}

impl<S> std::fmt::Debug for GroupCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCache")
            .field("group", &self.group)
            .finish()
    }
}
