//! Rehydration ordering and partial-failure handling for both strategies.

use std::time::Duration;

use serde_json::json;
use tether_storage::{InMemoryStore, LmdbStore, RestoreOutcome};
use tether_test_utils::fixtures::*;
use tether_test_utils::{
    CacheConfig, CacheOptions, Cacheable, DelayedStore, FailingStore, RecordingStore,
    RehydrationStrategy, StoreOp,
};

fn seeded() -> InMemoryStore {
    InMemoryStore::from_entries([
        (list_key(), json!([todo_key("b"), todo_key("a")])),
        (todo_key("a"), json!({"id": "a", "title": "A"})),
        (todo_key("b"), json!({"id": "b", "title": "B"})),
    ])
}

fn strategies() -> Vec<CacheConfig> {
    vec![
        CacheConfig::default(),
        per_key(None),
        per_key(Some(1)),
        per_key(Some(4)),
    ]
}

#[tokio::test]
async fn test_order_follows_index_not_completion() {
    for config in strategies() {
        let strategy = config.rehydration;
        // The first key is the slowest, so completion order is reversed.
        let store = DelayedStore::wrap(seeded()).delay_read(todo_key("b"), Duration::from_millis(40));
        let layer = layer_with(store, config);
        let group = todo_group();

        let restore = layer.group(&group).restore().await.unwrap();
        assert!(restore.is_complete(), "{strategy:?}");
        let ids: Vec<_> = group.members().iter().filter_map(|m| m.id()).collect();
        assert_eq!(ids, vec!["b", "a"], "{strategy:?}");
    }
}

#[tokio::test]
async fn test_partial_restore_for_every_strategy() {
    for config in strategies() {
        let strategy = config.rehydration;
        let store = InMemoryStore::from_entries([
            (list_key(), json!([todo_key("x"), todo_key("gone"), todo_key("junk")])),
            (todo_key("x"), json!({"id": "x"})),
            (todo_key("junk"), json!(42)),
        ]);
        let layer = layer_with(store, config);
        let group = todo_group();

        let restore = layer.group(&group).restore().await.unwrap();
        assert_eq!(restore.outcome, RestoreOutcome::Applied, "{strategy:?}");
        assert_eq!(group.len(), 1, "{strategy:?}");
        assert_eq!(restore.rehydration.missing, vec![todo_key("gone")], "{strategy:?}");
        assert_eq!(
            restore.rehydration.failed_keys(),
            vec![todo_key("junk")],
            "{strategy:?}"
        );
    }
}

#[tokio::test]
async fn test_batched_issues_one_read() {
    let layer = layer_with(RecordingStore::wrap(seeded()), CacheConfig::default());
    let group = todo_group();
    layer.group(&group).restore().await.unwrap();

    let ops = layer.store().ops();
    assert_eq!(
        ops,
        vec![
            StoreOp::Get(list_key()),
            StoreOp::GetMany(vec![todo_key("b"), todo_key("a")]),
        ]
    );
}

#[tokio::test]
async fn test_per_key_issues_one_read_per_member() {
    let layer = layer_with(RecordingStore::wrap(seeded()), per_key(Some(2)));
    let group = todo_group();
    layer.group(&group).restore().await.unwrap();

    let store = layer.store();
    assert_eq!(store.gets_for(&todo_key("a")), 1);
    assert_eq!(store.gets_for(&todo_key("b")), 1);
    assert!(!store.ops().iter().any(|op| matches!(op, StoreOp::GetMany(_))));
}

#[tokio::test]
async fn test_batched_failure_falls_back_to_per_key() {
    let store = FailingStore::wrap(seeded()).fail_get_many().fail_get(todo_key("a"));
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group();

    let restore = layer.group(&group).restore().await.unwrap();
    let ids: Vec<_> = group.members().iter().filter_map(|m| m.id()).collect();
    assert_eq!(ids, vec!["b"]);
    assert_eq!(restore.rehydration.failed_keys(), vec![todo_key("a")]);
}

#[tokio::test]
async fn test_restored_members_write_back_to_their_own_slot() {
    for config in strategies() {
        let layer = layer_with(seeded(), config);
        let group = todo_group();
        layer.group(&group).enable(CacheOptions::default()).unwrap();
        layer.group(&group).restore().await.unwrap();

        let a = group.get("a").unwrap();
        assert!(a.pinned_key().is_none());
        a.edit(attrs(json!({"title": "A2"})))
            .await
            .unwrap();
        assert_eq!(
            layer.store().peek(&todo_key("a")).await,
            Some(json!({"id": "a", "title": "A2"}))
        );
    }
}

#[tokio::test]
async fn test_rehydrator_directly() {
    let layer = layer_with(seeded(), per_key(None));
    assert_eq!(
        layer.rehydrator().strategy(),
        RehydrationStrategy::PerKey {
            max_concurrency: None
        }
    );

    let keys = vec![todo_key("a"), todo_key("nope"), todo_key("b")];
    let rehydration = layer.rehydrator().rehydrate(&keys, &todo_template()).await;
    let ids: Vec<_> = rehydration.records.iter().filter_map(|r| r.id()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(rehydration.missing, vec![todo_key("nope")]);
}

#[tokio::test]
async fn test_lmdb_round_trip_across_reopen() {
    let dir = tempfile::TempDir::new().expect("TempDir creation should succeed");

    {
        let store = LmdbStore::open(dir.path(), 10).expect("LMDB open should succeed");
        let layer = layer_with(store, CacheConfig::default());
        let group = todo_group();
        layer.group(&group).enable(CacheOptions::default()).unwrap();
        group
            .apply_fetch(vec![
                group.create(attrs(json!({"id": "2", "title": "second"}))),
                group.create(attrs(json!({"id": "1", "title": "first"}))),
            ])
            .await
            .unwrap();
    }

    let store = LmdbStore::open(dir.path(), 10).expect("LMDB reopen should succeed");
    let layer = layer_with(store, CacheConfig::default());
    let group = todo_group();
    let restore = layer.group(&group).restore().await.unwrap();

    assert!(restore.is_complete());
    let titles: Vec<_> = group
        .members()
        .iter()
        .filter_map(|m| m.get("title"))
        .collect();
    assert_eq!(titles, vec![json!("second"), json!("first")]);
}
