//! tether Test Utilities
//!
//! Shared test infrastructure for the tether workspace:
//! - Instrumented stores that record, fail, gate or delay operations
//! - Proptest generators for record attributes and key parts
//! - Fixtures for a small "todo" domain
//! - Tracing setup for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

// Re-export the types most tests need
pub use tether_core::{
    Attributes, CacheConfig, CacheOptions, Cacheable, ConfigError, Group, GroupEvent, KeySource,
    Mutation, Record, RecordEvent, RecordFactory, RecordTemplate, RehydrationError,
    RehydrationStrategy, StoreError, TetherError, TetherResult,
};
pub use tether_storage::{
    CacheLayer, InMemoryStore, KeyValueStore, RestoreOutcome, StoreResult, StoreStats,
};

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to debug
/// output for tether crates. Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tether_core=debug,tether_storage=debug,warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// RECORDING STORE
// ============================================================================

/// One call made against a [`RecordingStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Get(String),
    GetMany(Vec<String>),
    Set(String, Value),
    SetMany(Vec<String>),
    Delete(String),
    DeleteMany(Vec<String>),
}

/// Wraps a store and logs every call in order.
#[derive(Debug, Default)]
pub struct RecordingStore<S = InMemoryStore> {
    inner: S,
    ops: Mutex<Vec<StoreOp>>,
}

impl RecordingStore<InMemoryStore> {
    pub fn new() -> Self {
        Self::wrap(InMemoryStore::new())
    }
}

impl<S> RecordingStore<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every call so far.
    pub fn ops(&self) -> Vec<StoreOp> {
        lock(&self.ops).clone()
    }

    pub fn clear(&self) {
        lock(&self.ops).clear();
    }

    /// Values written to `key` by single-key sets, oldest first.
    pub fn set_values(&self, key: &str) -> Vec<Value> {
        lock(&self.ops)
            .iter()
            .filter_map(|op| match op {
                StoreOp::Set(k, value) if k == key => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of writes touching `key`, batched or not.
    pub fn sets_for(&self, key: &str) -> usize {
        lock(&self.ops)
            .iter()
            .filter(|op| match op {
                StoreOp::Set(k, _) => k == key,
                StoreOp::SetMany(keys) => keys.iter().any(|k| k == key),
                _ => false,
            })
            .count()
    }

    /// Number of deletes touching `key`, batched or not.
    pub fn deletes_for(&self, key: &str) -> usize {
        lock(&self.ops)
            .iter()
            .filter(|op| match op {
                StoreOp::Delete(k) => k == key,
                StoreOp::DeleteMany(keys) => keys.iter().any(|k| k == key),
                _ => false,
            })
            .count()
    }

    /// Number of single-key reads of `key`.
    pub fn gets_for(&self, key: &str) -> usize {
        lock(&self.ops)
            .iter()
            .filter(|op| matches!(op, StoreOp::Get(k) if k == key))
            .count()
    }

    fn log(&self, op: StoreOp) {
        lock(&self.ops).push(op);
    }
}

#[async_trait]
impl<S> KeyValueStore for RecordingStore<S>
where
    S: KeyValueStore,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.log(StoreOp::Get(key.to_string()));
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        self.log(StoreOp::GetMany(keys.to_vec()));
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.log(StoreOp::Set(key.to_string(), value.clone()));
        self.inner.set(key, value).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        self.log(StoreOp::SetMany(
            entries.iter().map(|(k, _)| k.clone()).collect(),
        ));
        self.inner.set_many(entries).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.log(StoreOp::Delete(key.to_string()));
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<()> {
        self.log(StoreOp::DeleteMany(keys.to_vec()));
        self.inner.delete_many(keys).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Wraps a store and fails chosen operations on chosen keys.
#[derive(Debug, Default)]
pub struct FailingStore<S = InMemoryStore> {
    inner: S,
    failing_gets: Mutex<HashSet<String>>,
    failing_sets: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_get_many: AtomicBool,
}

impl<S> FailingStore<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            failing_gets: Mutex::new(HashSet::new()),
            failing_sets: Mutex::new(HashSet::new()),
            failing_deletes: Mutex::new(HashSet::new()),
            fail_get_many: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_get(self, key: impl Into<String>) -> Self {
        lock(&self.failing_gets).insert(key.into());
        self
    }

    pub fn fail_set(self, key: impl Into<String>) -> Self {
        lock(&self.failing_sets).insert(key.into());
        self
    }

    pub fn fail_delete(self, key: impl Into<String>) -> Self {
        lock(&self.failing_deletes).insert(key.into());
        self
    }

    /// Fail every batched read.
    pub fn fail_get_many(self) -> Self {
        self.fail_get_many.store(true, Ordering::Relaxed);
        self
    }

    /// Stop failing anything.
    pub fn heal(&self) {
        lock(&self.failing_gets).clear();
        lock(&self.failing_sets).clear();
        lock(&self.failing_deletes).clear();
        self.fail_get_many.store(false, Ordering::Relaxed);
    }

    fn injected(op: &str, key: &str) -> StoreError {
        StoreError::Backend {
            reason: format!("injected {op} failure for {key}"),
        }
    }
}

#[async_trait]
impl<S> KeyValueStore for FailingStore<S>
where
    S: KeyValueStore,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        if lock(&self.failing_gets).contains(key) {
            return Err(Self::injected("get", key));
        }
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        if self.fail_get_many.load(Ordering::Relaxed) {
            return Err(Self::injected("get_many", &keys.join(",")));
        }
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        if lock(&self.failing_sets).contains(key) {
            return Err(Self::injected("set", key));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if lock(&self.failing_deletes).contains(key) {
            return Err(Self::injected("delete", key));
        }
        self.inner.delete(key).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// GATED STORE
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Concurrency {
    current: usize,
    max: usize,
}

/// Wraps a store and holds every write at a gate until it is opened.
///
/// Tracks how many writes per key were in flight at once, which is how
/// tests observe the per-key serialization of the cache layer.
#[derive(Debug)]
pub struct GatedStore<S = InMemoryStore> {
    inner: S,
    open: AtomicBool,
    opened: Notify,
    blocked: AtomicUsize,
    blocked_changed: Notify,
    concurrency: Mutex<HashMap<String, Concurrency>>,
}

impl<S> GatedStore<S> {
    /// Wrap `inner` with the gate closed.
    pub fn closed(inner: S) -> Self {
        Self {
            inner,
            open: AtomicBool::new(false),
            opened: Notify::new(),
            blocked: AtomicUsize::new(0),
            blocked_changed: Notify::new(),
            concurrency: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
        self.opened.notify_waiters();
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Writes currently waiting at the gate.
    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::Acquire)
    }

    /// Wait until at least `n` writes are waiting at the gate.
    ///
    /// # Panics
    ///
    /// After five seconds without reaching `n`.
    pub async fn wait_for_blocked(&self, n: usize) {
        let wait = async {
            loop {
                let changed = self.blocked_changed.notified();
                if self.blocked() >= n {
                    return;
                }
                changed.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!("Timed out waiting for {} blocked writes, saw {}", n, self.blocked());
        }
    }

    /// Most writes to `key` that were ever in flight at the same time.
    pub fn max_concurrent_sets(&self, key: &str) -> usize {
        lock(&self.concurrency).get(key).map_or(0, |c| c.max)
    }

    async fn pass_gate(&self) {
        self.blocked.fetch_add(1, Ordering::AcqRel);
        self.blocked_changed.notify_waiters();
        loop {
            let opened = self.opened.notified();
            if self.is_open() {
                break;
            }
            opened.await;
        }
        self.blocked.fetch_sub(1, Ordering::AcqRel);
        self.blocked_changed.notify_waiters();
    }

    fn enter(&self, key: &str) {
        let mut concurrency = lock(&self.concurrency);
        let entry = concurrency.entry(key.to_string()).or_default();
        entry.current += 1;
        entry.max = entry.max.max(entry.current);
    }

    fn exit(&self, key: &str) {
        if let Some(entry) = lock(&self.concurrency).get_mut(key) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

#[async_trait]
impl<S> KeyValueStore for GatedStore<S>
where
    S: KeyValueStore,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.enter(key);
        self.pass_gate().await;
        let result = self.inner.set(key, value).await;
        self.exit(key);
        result
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.enter(key);
        self.pass_gate().await;
        let result = self.inner.delete(key).await;
        self.exit(key);
        result
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// DELAYED STORE
// ============================================================================

/// Wraps a store and delays reads of chosen keys.
#[derive(Debug, Default)]
pub struct DelayedStore<S = InMemoryStore> {
    inner: S,
    read_delays: HashMap<String, Duration>,
}

impl<S> DelayedStore<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            read_delays: HashMap::new(),
        }
    }

    pub fn delay_read(mut self, key: impl Into<String>, delay: Duration) -> Self {
        self.read_delays.insert(key.into(), delay);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn delay_for(&self, key: &str) -> Option<Duration> {
        self.read_delays.get(key).copied()
    }
}

#[async_trait]
impl<S> KeyValueStore for DelayedStore<S>
where
    S: KeyValueStore,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        if let Some(delay) = self.delay_for(key) {
            tokio::time::sleep(delay).await;
        }
        self.inner.get(key).await
    }

    /// A batched read takes as long as its slowest key.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        if let Some(delay) = keys.iter().filter_map(|k| self.delay_for(k)).max() {
            tokio::time::sleep(delay).await;
        }
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating record data.

    use super::*;
    use proptest::prelude::*;

    /// Generate a record identifier that is safe as a key segment.
    pub fn arb_record_id() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,12}"
    }

    /// Generate a key prefix.
    pub fn arb_prefix() -> impl Strategy<Value = String> {
        "[a-z]{1,8}-"
    }

    /// Generate a persisted todo's attributes.
    pub fn arb_attributes() -> impl Strategy<Value = Attributes> {
        (arb_record_id(), "[ -~]{0,32}", any::<bool>(), any::<i32>()).prop_map(
            |(id, title, done, rank)| {
                let mut attributes = Attributes::new();
                attributes.insert("id".to_string(), Value::String(id));
                attributes.insert("title".to_string(), Value::String(title));
                attributes.insert("done".to_string(), Value::Bool(done));
                attributes.insert("rank".to_string(), Value::from(rank));
                attributes
            },
        )
    }

    /// Generate attributes for several todos with distinct ids.
    pub fn arb_attribute_list(max: usize) -> impl Strategy<Value = Vec<Attributes>> {
        prop::collection::vec(arb_attributes(), 0..=max).prop_map(|list| {
            let mut seen = HashSet::new();
            list.into_iter()
                .filter(|attributes| match attributes.get("id") {
                    Some(Value::String(id)) => seen.insert(id.clone()),
                    _ => false,
                })
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records, groups and layers for the "todo" domain.
    //!
    //! Todos live under the `todos` resource: a todo with id `7` is cached
    //! at `<prefix>todos/7`, the todo list at `<prefix>todos`.

    use super::*;
    use std::sync::Arc;

    /// Convert a JSON object literal into attributes.
    ///
    /// # Panics
    ///
    /// If `value` is not an object.
    pub fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            other => panic!("Expected a JSON object, got: {}", other),
        }
    }

    pub fn todo_template() -> RecordTemplate {
        RecordTemplate::new("todo").with_key_source(KeySource::resource("todos"))
    }

    /// A standalone todo.
    pub fn todo(value: Value) -> Arc<Record> {
        todo_template().create(attrs(value))
    }

    /// An empty todo list.
    pub fn todo_group() -> Arc<Group> {
        Arc::new(
            Group::new("todo", Arc::new(todo_template()))
                .with_key_source(KeySource::resource("todos")),
        )
    }

    /// A todo list holding one persisted todo per id, without emitting events.
    pub fn todo_group_with(ids: &[&str]) -> Arc<Group> {
        let group = todo_group();
        let members = ids
            .iter()
            .map(|id| group.create(attrs(serde_json::json!({ "id": id, "title": format!("todo {id}") }))))
            .collect();
        group.reset(members);
        group
    }

    /// Default cache key of the todo with `id`.
    pub fn todo_key(id: &str) -> String {
        format!("{}todos/{}", tether_core::FALLBACK_PREFIX, id)
    }

    /// Default cache key of the todo list.
    pub fn list_key() -> String {
        format!("{}todos", tether_core::FALLBACK_PREFIX)
    }

    /// A layer over a fresh in-memory store with the default config.
    pub fn memory_layer() -> CacheLayer<InMemoryStore> {
        CacheLayer::new(InMemoryStore::new(), CacheConfig::default())
    }

    pub fn layer_with<S>(store: S, config: CacheConfig) -> CacheLayer<S>
    where
        S: KeyValueStore + 'static,
    {
        CacheLayer::new(store, config)
    }

    /// Per-key rehydration config with an optional concurrency bound.
    pub fn per_key(max_concurrency: Option<usize>) -> CacheConfig {
        CacheConfig::new().with_rehydration(RehydrationStrategy::PerKey { max_concurrency })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for tether error variants.

    use super::*;

    /// Assert that a result failed with a store error.
    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &TetherResult<T>) {
        match result {
            Err(TetherError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    /// Assert that a result failed with a config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &TetherResult<T>) {
        match result {
            Err(TetherError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a result failed because no key source was configured.
    #[track_caller]
    pub fn assert_missing_key_source<T: std::fmt::Debug>(result: &TetherResult<T>) {
        match result {
            Err(TetherError::Config(ConfigError::MissingKeySource { .. })) => {}
            other => panic!("Expected MissingKeySource error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
