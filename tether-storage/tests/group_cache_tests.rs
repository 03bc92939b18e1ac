//! Group index maintenance, member cascades and group restore.

use std::sync::Arc;

use serde_json::json;
use tether_storage::{InMemoryStore, RestoreOutcome};
use tether_test_utils::assertions::assert_missing_key_source;
use tether_test_utils::fixtures::*;
use tether_test_utils::{
    init_tracing, CacheConfig, CacheOptions, FailingStore, Group, KeySource, RecordFactory,
    RecordTemplate, RecordingStore, RehydrationError,
};

#[tokio::test]
async fn test_index_excludes_new_members() {
    let layer = memory_layer();
    let group = todo_group();
    group.reset(vec![
        group.create(attrs(json!({"id": "1"}))),
        group.create(attrs(json!({"title": "not saved yet"}))),
    ]);

    layer.group(&group).cache().await.unwrap();
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1")]))
    );
}

#[tokio::test]
async fn test_enable_cascades_to_current_and_future_members() {
    let layer = memory_layer();
    let group = todo_group_with(&["1"]);
    let cache = layer.group(&group);
    cache.enable(CacheOptions::default()).unwrap();

    let first = group.get("1").unwrap();
    assert!(layer.record(&first).is_enabled());

    let added = group.create(attrs(json!({"id": "2", "title": "later"})));
    group.add(Arc::clone(&added)).await.unwrap();
    assert!(layer.record(&added).is_enabled());

    assert_eq!(
        layer.store().peek(&todo_key("2")).await,
        Some(json!({"id": "2", "title": "later"}))
    );
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1"), todo_key("2")]))
    );
}

#[tokio::test]
async fn test_adding_new_member_leaves_index_alone() {
    let layer = memory_layer();
    let group = todo_group_with(&["1"]);
    layer.group(&group).enable(CacheOptions::default()).unwrap();

    let draft = group.create(attrs(json!({"title": "draft"})));
    group.add(Arc::clone(&draft)).await.unwrap();
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1")]))
    );

    // Once saved, the member's own write also refreshes the index.
    draft.apply_save(attrs(json!({"id": "9"}))).await.unwrap();
    assert!(layer.store().contains(&todo_key("9")).await);
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1"), todo_key("9")]))
    );
}

#[tokio::test]
async fn test_member_removed_evicts_and_rewrites_index() {
    let layer = memory_layer();
    let group = todo_group();
    layer.group(&group).enable(CacheOptions::default()).unwrap();
    group
        .apply_fetch(vec![
            group.create(attrs(json!({"id": "1"}))),
            group.create(attrs(json!({"id": "2"}))),
            group.create(attrs(json!({"id": "3"}))),
        ])
        .await
        .unwrap();

    let removed = group.get("2").unwrap();
    group.remove(&removed).await.unwrap();

    assert!(!layer.store().contains(&todo_key("2")).await);
    assert!(!layer.record(&removed).is_enabled());
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1"), todo_key("3")]))
    );
}

#[tokio::test]
async fn test_fetch_caches_every_member_and_index() {
    init_tracing();
    let layer = layer_with(RecordingStore::new(), CacheConfig::default());
    let group = todo_group();
    layer.group(&group).enable(CacheOptions::default()).unwrap();

    group
        .apply_fetch(vec![
            group.create(attrs(json!({"id": "b", "title": "B"}))),
            group.create(attrs(json!({"id": "a", "title": "A"}))),
        ])
        .await
        .unwrap();

    let store = layer.store();
    assert_eq!(store.sets_for(&todo_key("a")), 1);
    assert_eq!(store.sets_for(&todo_key("b")), 1);
    assert_eq!(store.sets_for(&list_key()), 1);
    assert_eq!(
        store.inner().peek(&list_key()).await,
        Some(json!([todo_key("b"), todo_key("a")]))
    );

    // Fetched members are enabled, so their own edits write through.
    let a = group.get("a").unwrap();
    assert!(layer.record(&a).is_enabled());
    a.edit(attrs(json!({"title": "A2"}))).await.unwrap();
    assert_eq!(
        store.inner().peek(&todo_key("a")).await,
        Some(json!({"id": "a", "title": "A2"}))
    );
}

#[tokio::test]
async fn test_index_failure_does_not_fail_member_write() {
    let store = FailingStore::wrap(InMemoryStore::new()).fail_set(list_key());
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group_with(&["1"]);
    layer.group(&group).enable(CacheOptions::default()).unwrap();

    let member = group.get("1").unwrap();
    let write = layer.record(&member).cache().await.unwrap();

    assert_eq!(write.key.as_str(), todo_key("1"));
    assert!(write.index_error.is_some());
    assert!(layer.store().inner().contains(&todo_key("1")).await);
    assert!(!layer.store().inner().contains(&list_key()).await);
}

#[tokio::test]
async fn test_group_evict_removes_members_and_index() {
    let layer = memory_layer();
    let group = todo_group_with(&["1", "2"]);
    let cache = layer.group(&group);
    cache.enable(CacheOptions::default()).unwrap();
    cache.cache_all().await.unwrap();
    assert_eq!(layer.store().len().await, 3);

    cache.evict().await.unwrap();
    assert!(layer.store().is_empty().await);
    assert!(!cache.is_enabled());
    assert_eq!(group.events().subscriber_count(), 0);
    for member in group.members() {
        assert!(!layer.record(&member).is_enabled());
    }
}

#[tokio::test]
async fn test_restore_rebuilds_members_in_index_order() {
    let store = InMemoryStore::from_entries([
        (list_key(), json!([todo_key("b"), todo_key("a")])),
        (todo_key("a"), json!({"id": "a", "title": "A"})),
        (todo_key("b"), json!({"id": "b", "title": "B"})),
    ]);
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group();
    let cache = layer.group(&group);
    cache.enable(CacheOptions::default()).unwrap();

    let restore = cache.restore().await.unwrap();
    assert_eq!(restore.outcome, RestoreOutcome::Applied);
    assert!(restore.is_complete());

    let ids: Vec<_> = group.members().iter().filter_map(|m| m.id()).collect();
    assert_eq!(ids, vec!["b", "a"]);
    for member in group.members() {
        assert!(layer.record(&member).is_enabled());
        assert!(Arc::ptr_eq(&member.owner().unwrap(), &group));
        assert!(!member.has_user_changes());
    }
}

#[tokio::test]
async fn test_restore_tolerates_missing_members() {
    let store = InMemoryStore::from_entries([
        (list_key(), json!([todo_key("x"), todo_key("missing")])),
        (todo_key("x"), json!({"id": "x"})),
    ]);
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group();

    let restore = layer.group(&group).restore().await.unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(restore.members().len(), 1);
    assert_eq!(restore.rehydration.missing, vec![todo_key("missing")]);

    let err = restore.into_result().unwrap_err();
    assert!(matches!(err, RehydrationError::Partial { restored: 1, .. }));
}

#[tokio::test]
async fn test_restore_drops_invalid_index_entries() {
    let store = InMemoryStore::from_entries([
        (
            list_key(),
            json!([todo_key("a"), "", null, 5, todo_key("a"), todo_key("b")]),
        ),
        (todo_key("a"), json!({"id": "a"})),
        (todo_key("b"), json!({"id": "b"})),
    ]);
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group();

    let restore = layer.group(&group).restore().await.unwrap();
    assert_eq!(restore.dropped_entries, 4);
    let ids: Vec<_> = group.members().iter().filter_map(|m| m.id()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_restore_of_destroyed_group_is_discarded() {
    let store = InMemoryStore::from_entries([
        (list_key(), json!([todo_key("a")])),
        (todo_key("a"), json!({"id": "a"})),
    ]);
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group_with(&["keep"]);
    group.destroy();

    let restore = layer.group(&group).restore().await.unwrap();
    assert_eq!(restore.outcome, RestoreOutcome::Discarded);
    let ids: Vec<_> = group.members().iter().filter_map(|m| m.id()).collect();
    assert_eq!(ids, vec!["keep"]);
}

/// A record shared by two cached groups is evicted by either group's
/// cleanup, leaving a dangling key in the other group's index. Ownership
/// is single-owner; this test pins that behaviour down.
#[tokio::test]
async fn test_shared_member_is_evicted_by_either_owner() {
    let layer = memory_layer();
    let inbox = todo_group();
    let archive = Arc::new(
        Group::new("todo", Arc::new(todo_template()))
            .with_key_source(KeySource::resource("archive")),
    );
    layer.group(&inbox).enable(CacheOptions::default()).unwrap();
    layer.group(&archive).enable(CacheOptions::default()).unwrap();

    let shared = inbox.create(attrs(json!({"id": "1", "title": "shared"})));
    inbox.add(Arc::clone(&shared)).await.unwrap();
    archive.add(Arc::clone(&shared)).await.unwrap();

    // The last group to add the record owns it.
    assert!(Arc::ptr_eq(&shared.owner().unwrap(), &archive));

    inbox.remove(&shared).await.unwrap();
    assert!(!layer.store().contains(&todo_key("1")).await);
    assert_eq!(
        layer.store().peek("tether-cache-archive").await,
        Some(json!([todo_key("1")]))
    );

    let fresh_archive = Arc::new(
        Group::new("todo", Arc::new(todo_template()))
            .with_key_source(KeySource::resource("archive")),
    );
    let restore = layer.group(&fresh_archive).restore().await.unwrap();
    assert!(fresh_archive.is_empty());
    assert_eq!(restore.rehydration.missing, vec![todo_key("1")]);
}

#[tokio::test]
async fn test_failed_enable_leaves_group_disabled() {
    let layer = memory_layer();
    let group = todo_group();
    let keyless = RecordTemplate::new("todo").create(attrs(json!({"id": "x"})));
    group.reset(vec![keyless]);

    let cache = layer.group(&group);
    assert_missing_key_source(&cache.enable(CacheOptions::default()));
    assert!(!cache.is_enabled());
    assert_eq!(group.events().subscriber_count(), 0);

    // Once the offending member is gone, enabling works and adds are cached.
    group.reset(Vec::new());
    assert!(cache.enable(CacheOptions::default()).unwrap());
    let added = group.create(attrs(json!({"id": "1"})));
    group.add(Arc::clone(&added)).await.unwrap();
    assert!(layer.record(&added).is_enabled());
    assert!(layer.store().contains(&todo_key("1")).await);
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1")]))
    );
}

#[tokio::test]
async fn test_members_restored_without_id_stay_in_index() {
    for config in [CacheConfig::default(), per_key(None)] {
        let strategy = config.rehydration;
        let store = InMemoryStore::from_entries([
            (list_key(), json!([todo_key("a"), "legacy-key"])),
            (todo_key("a"), json!({"id": "a"})),
            ("legacy-key".to_string(), json!({"title": "imported"})),
        ]);
        let layer = layer_with(store, config);
        let group = todo_group();
        let cache = layer.group(&group);

        let restore = cache.restore().await.unwrap();
        assert!(restore.is_complete(), "{strategy:?}");
        assert_eq!(group.len(), 2, "{strategy:?}");

        cache.cache_all().await.unwrap();
        assert_eq!(
            layer.store().peek(&list_key()).await,
            Some(json!([todo_key("a"), "legacy-key"])),
            "{strategy:?}"
        );
        assert_eq!(
            layer.store().peek("legacy-key").await,
            Some(json!({"title": "imported"})),
            "{strategy:?}"
        );
    }
}

#[tokio::test]
async fn test_deleted_member_stays_listed_until_removed() {
    let layer = memory_layer();
    let group = todo_group();
    layer.group(&group).enable(CacheOptions::default()).unwrap();
    group
        .apply_fetch(vec![
            group.create(attrs(json!({"id": "1"}))),
            group.create(attrs(json!({"id": "2"}))),
        ])
        .await
        .unwrap();

    let deleted = group.get("2").unwrap();
    deleted.apply_delete().await.unwrap();
    assert!(!layer.store().contains(&todo_key("2")).await);
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1"), todo_key("2")]))
    );

    let fresh = todo_group();
    let restore = layer.group(&fresh).restore().await.unwrap();
    assert_eq!(restore.rehydration.missing, vec![todo_key("2")]);

    group.remove(&deleted).await.unwrap();
    assert_eq!(
        layer.store().peek(&list_key()).await,
        Some(json!([todo_key("1")]))
    );
}
