//! Records: single networked domain objects.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::Value;

use crate::{
    CacheState, Cacheable, EntityRole, EventBus, Group, KeySource, RecordEvent, TetherResult,
};

/// Flat attribute mapping of a record.
pub type Attributes = serde_json::Map<String, Value>;

/// How an attribute change should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    /// A local user edit. Touched attributes are marked changed-by-user.
    User,
    /// Data applied from the remote. Clears the changed mark on touched
    /// attributes.
    Sync,
    /// Programmatic hydration from the cache. Change marks are untouched.
    Silent,
}

/// Default attribute holding a record's identifier.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// A single cached domain entity.
///
/// Records are shared as `Arc<Record>`; all state uses interior mutability
/// so the remote sync source, the application and the cache adapters can
/// hold the same instance.
pub struct Record {
    kind: String,
    id_attribute: String,
    key_source: Option<KeySource>,
    attributes: RwLock<Attributes>,
    user_changed: RwLock<BTreeSet<String>>,
    pinned_key: RwLock<Option<String>>,
    owner: RwLock<Weak<Group>>,
    live: AtomicBool,
    cache_state: CacheState,
    events: EventBus<RecordEvent>,
}

impl Record {
    fn new(
        kind: String,
        id_attribute: String,
        key_source: Option<KeySource>,
        attributes: Attributes,
    ) -> Self {
        Self {
            kind,
            id_attribute,
            key_source,
            attributes: RwLock::new(attributes),
            user_changed: RwLock::new(BTreeSet::new()),
            pinned_key: RwLock::new(None),
            owner: RwLock::new(Weak::new()),
            live: AtomicBool::new(true),
            cache_state: CacheState::new(),
            events: EventBus::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// The identifier, read from the id attribute.
    ///
    /// Strings and numbers are accepted; anything else counts as absent.
    pub fn id(&self) -> Option<String> {
        let attributes = self.attributes.read().unwrap_or_else(PoisonError::into_inner);
        match attributes.get(&self.id_attribute) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// A record with no identifier has never been persisted.
    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    /// Snapshot of the current attributes.
    pub fn attributes(&self) -> Attributes {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Merge attributes into the record.
    ///
    /// Returns the names of attributes whose value actually changed.
    pub fn set(&self, attributes: Attributes, mutation: Mutation) -> Vec<String> {
        let mut changed = Vec::new();
        {
            let mut current = self.attributes.write().unwrap_or_else(PoisonError::into_inner);
            for (name, value) in attributes {
                if current.get(&name) != Some(&value) {
                    changed.push(name.clone());
                }
                current.insert(name, value);
            }
        }

        if !changed.is_empty() {
            let mut marks = self.user_changed.write().unwrap_or_else(PoisonError::into_inner);
            match mutation {
                Mutation::User => marks.extend(changed.iter().cloned()),
                Mutation::Sync => {
                    for name in &changed {
                        marks.remove(name);
                    }
                }
                Mutation::Silent => {}
            }
        }

        changed
    }

    /// Attributes changed by the user since they were last synced.
    pub fn user_changes(&self) -> Vec<String> {
        self.user_changed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn has_user_changes(&self) -> bool {
        !self
            .user_changed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Address this record by an exact cache key until it has an id.
    pub fn pin_key(&self, key: impl Into<String>) {
        *self.pinned_key.write().unwrap_or_else(PoisonError::into_inner) = Some(key.into());
    }

    pub fn unpin_key(&self) {
        *self.pinned_key.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The group this record is cached under, if it is still alive.
    pub fn owner(&self) -> Option<Arc<Group>> {
        self.owner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    pub(crate) fn set_owner(&self, group: &Arc<Group>) {
        *self.owner.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(group);
    }

    /// Drop the owner link if it points at `group`.
    pub(crate) fn release_owner(&self, group: &Group) {
        let mut owner = self.owner.write().unwrap_or_else(PoisonError::into_inner);
        if std::ptr::eq(owner.as_ptr(), group) {
            *owner = Weak::new();
        }
    }

    /// `false` once the record has been destroyed.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark the record as dereferenced. In-flight restores discard their
    /// result.
    pub fn destroy(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub fn events(&self) -> &EventBus<RecordEvent> {
        &self.events
    }

    // ========================================================================
    // REMOTE SYNC SOURCE / APPLICATION ENTRY POINTS
    // ========================================================================

    /// Apply a local user edit and notify subscribers.
    pub async fn edit(&self, attributes: Attributes) -> TetherResult<()> {
        if self.set(attributes, Mutation::User).is_empty() {
            return Ok(());
        }
        self.events.emit(RecordEvent::Changed).await
    }

    /// Apply attributes fetched from the remote.
    pub async fn apply_fetch(&self, attributes: Attributes) -> TetherResult<()> {
        self.set(attributes, Mutation::Sync);
        self.events.emit(RecordEvent::Fetched).await
    }

    /// Apply the remote's response to a save.
    pub async fn apply_save(&self, attributes: Attributes) -> TetherResult<()> {
        self.set(attributes, Mutation::Sync);
        self.events.emit(RecordEvent::Saved).await
    }

    /// The remote deleted the record: notify, then destroy.
    ///
    /// The record stays in its owning group. Until the caller removes it
    /// there, the group's index keeps listing the deleted key, and a later
    /// restore reports that key as missing.
    pub async fn apply_delete(&self) -> TetherResult<()> {
        let result = self.events.emit(RecordEvent::Deleted).await;
        self.destroy();
        result
    }
}

impl Cacheable for Record {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn role(&self) -> EntityRole {
        EntityRole::Record
    }

    fn key_source(&self) -> Option<&KeySource> {
        self.key_source.as_ref()
    }

    fn identity(&self) -> Option<String> {
        self.id()
    }

    fn pinned_key(&self) -> Option<String> {
        self.pinned_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cache_state(&self) -> &CacheState {
        &self.cache_state
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("attributes", &self.attributes())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Builds records of one kind, e.g. when a group is rehydrated.
pub trait RecordFactory: Send + Sync {
    fn create(&self, attributes: Attributes) -> Arc<Record>;

    /// An empty record pinned to `key`, to be filled by a restore.
    fn placeholder(&self, key: &str) -> Arc<Record> {
        let record = self.create(Attributes::new());
        record.pin_key(key);
        record
    }
}

/// Shape shared by every record of a kind.
#[derive(Debug, Clone)]
pub struct RecordTemplate {
    kind: String,
    id_attribute: String,
    key_source: Option<KeySource>,
}

impl RecordTemplate {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            key_source: None,
        }
    }

    pub fn with_id_attribute(mut self, name: impl Into<String>) -> Self {
        self.id_attribute = name.into();
        self
    }

    pub fn with_key_source(mut self, source: KeySource) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl RecordFactory for RecordTemplate {
    fn create(&self, attributes: Attributes) -> Arc<Record> {
        Arc::new(Record::new(
            self.kind.clone(),
            self.id_attribute.clone(),
            self.key_source.clone(),
            attributes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn template() -> RecordTemplate {
        RecordTemplate::new("todo").with_key_source(KeySource::resource("todos"))
    }

    #[test]
    fn test_id_from_string_or_number() {
        let t = template();
        assert_eq!(t.create(attrs(json!({"id": "a1"}))).id().as_deref(), Some("a1"));
        assert_eq!(t.create(attrs(json!({"id": 42}))).id().as_deref(), Some("42"));
        assert!(t.create(attrs(json!({"id": null}))).is_new());
        assert!(t.create(attrs(json!({"title": "x"}))).is_new());
    }

    #[test]
    fn test_custom_id_attribute() {
        let t = RecordTemplate::new("doc").with_id_attribute("_id");
        let record = t.create(attrs(json!({"_id": "d9", "id": "ignored"})));
        assert_eq!(record.id().as_deref(), Some("d9"));
    }

    #[test]
    fn test_set_reports_only_changed_attributes() {
        let record = template().create(attrs(json!({"id": "1", "title": "a"})));
        let changed = record.set(attrs(json!({"title": "a", "done": true})), Mutation::Sync);
        assert_eq!(changed, vec!["done".to_string()]);
    }

    #[test]
    fn test_mutation_kinds_track_user_changes() {
        let record = template().create(attrs(json!({"id": "1"})));

        record.set(attrs(json!({"title": "draft"})), Mutation::User);
        assert_eq!(record.user_changes(), vec!["title".to_string()]);

        record.set(attrs(json!({"done": false})), Mutation::Silent);
        assert_eq!(record.user_changes(), vec!["title".to_string()]);

        record.set(attrs(json!({"title": "saved"})), Mutation::Sync);
        assert!(!record.has_user_changes());
    }

    #[test]
    fn test_placeholder_is_pinned() {
        let record = template().placeholder("tether-cache-todos/5");
        assert!(record.is_new());
        assert_eq!(
            Cacheable::pinned_key(&*record).as_deref(),
            Some("tether-cache-todos/5")
        );
        record.unpin_key();
        assert_eq!(Cacheable::pinned_key(&*record), None);
    }

    #[tokio::test]
    async fn test_edit_emits_changed_only_on_change() {
        use std::sync::atomic::AtomicUsize;

        let record = template().create(attrs(json!({"id": "1", "title": "a"})));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        record.events().subscribe(move |event| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(event, RecordEvent::Changed);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        record.edit(attrs(json!({"title": "a"}))).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        record.edit(attrs(json!({"title": "b"}))).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_delete_destroys() {
        let record = template().create(attrs(json!({"id": "1"})));
        record.apply_delete().await.unwrap();
        assert!(!record.is_live());
    }
}
