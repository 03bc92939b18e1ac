//! Groups: ordered collections of records of one kind.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::{
    Attributes, CacheState, Cacheable, EntityRole, EventBus, GroupEvent, KeySource, Record,
    RecordFactory, TetherResult,
};

/// An ordered group of records.
///
/// Membership changes made through [`add`](Self::add) and
/// [`remove`](Self::remove) emit events; [`reset`](Self::reset) replaces
/// members silently. A group owns the records it holds for caching
/// purposes: adding a record points its owner link at this group.
pub struct Group {
    kind: String,
    key_source: Option<KeySource>,
    factory: Arc<dyn RecordFactory>,
    members: RwLock<Vec<Arc<Record>>>,
    live: AtomicBool,
    cache_state: CacheState,
    events: EventBus<GroupEvent>,
}

impl Group {
    pub fn new(kind: impl Into<String>, factory: Arc<dyn RecordFactory>) -> Self {
        Self {
            kind: kind.into(),
            key_source: None,
            factory,
            members: RwLock::new(Vec::new()),
            live: AtomicBool::new(true),
            cache_state: CacheState::new(),
            events: EventBus::new(),
        }
    }

    pub fn with_key_source(mut self, source: KeySource) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn factory(&self) -> Arc<dyn RecordFactory> {
        Arc::clone(&self.factory)
    }

    /// Build a record of this group's kind without adding it.
    pub fn create(&self, attributes: Attributes) -> Arc<Record> {
        self.factory.create(attributes)
    }

    /// Snapshot of the current members, in order.
    pub fn members(&self) -> Vec<Arc<Record>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.members.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, record: &Arc<Record>) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|member| Arc::ptr_eq(member, record))
    }

    /// Find a member by identifier.
    pub fn get(&self, id: &str) -> Option<Arc<Record>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|member| member.id().as_deref() == Some(id))
            .cloned()
    }

    /// Append a record and emit [`GroupEvent::MemberAdded`].
    ///
    /// Returns `false` if the record, or another record with the same id,
    /// is already a member.
    pub async fn add(self: &Arc<Self>, record: Arc<Record>) -> TetherResult<bool> {
        {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            let id = record.id();
            let duplicate = members.iter().any(|member| {
                Arc::ptr_eq(member, &record) || (id.is_some() && member.id() == id)
            });
            if duplicate {
                return Ok(false);
            }
            members.push(Arc::clone(&record));
        }
        record.set_owner(self);
        self.events.emit(GroupEvent::MemberAdded(record)).await?;
        Ok(true)
    }

    /// Remove a record and emit [`GroupEvent::MemberRemoved`].
    ///
    /// Returns `false` if the record was not a member.
    pub async fn remove(self: &Arc<Self>, record: &Arc<Record>) -> TetherResult<bool> {
        let removed = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            let before = members.len();
            members.retain(|member| !Arc::ptr_eq(member, record));
            members.len() != before
        };
        if !removed {
            return Ok(false);
        }
        record.release_owner(self);
        self.events
            .emit(GroupEvent::MemberRemoved(Arc::clone(record)))
            .await?;
        Ok(true)
    }

    /// Replace every member without emitting events.
    pub fn reset(self: &Arc<Self>, records: Vec<Arc<Record>>) {
        let previous = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *members, records.clone())
        };
        for old in &previous {
            if !records.iter().any(|r| Arc::ptr_eq(r, old)) {
                old.release_owner(self);
            }
        }
        for record in &records {
            record.set_owner(self);
        }
    }

    /// Apply a member list fetched from the remote and emit
    /// [`GroupEvent::Fetched`].
    pub async fn apply_fetch(self: &Arc<Self>, records: Vec<Arc<Record>>) -> TetherResult<()> {
        self.reset(records);
        self.events.emit(GroupEvent::Fetched).await
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark the group as dereferenced. In-flight restores discard their
    /// result.
    pub fn destroy(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub fn events(&self) -> &EventBus<GroupEvent> {
        &self.events
    }
}

impl Cacheable for Group {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn role(&self) -> EntityRole {
        EntityRole::Group
    }

    fn key_source(&self) -> Option<&KeySource> {
        self.key_source.as_ref()
    }

    fn identity(&self) -> Option<String> {
        None
    }

    fn cache_state(&self) -> &CacheState {
        &self.cache_state
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("kind", &self.kind)
            .field("key_source", &self.key_source)
            .field("members", &self.len())
            .field("live", &self.is_live())
            .finish()
    }
}
