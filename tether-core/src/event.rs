//! Typed lifecycle events and the bus that delivers them.
//!
//! The remote sync source emits events on a record or group; cache adapters
//! subscribe to them. Emitting awaits every handler, so the emitter learns
//! about write-through failures instead of losing them.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{join_all, BoxFuture};

use crate::{Record, TetherResult};

/// Events emitted on a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordEvent {
    /// Attributes were loaded from the remote.
    Fetched,
    /// The remote accepted a save.
    Saved,
    /// A local user edit changed attributes.
    Changed,
    /// The remote deleted the record.
    Deleted,
}

/// Events emitted on a group.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// The member list was loaded from the remote.
    Fetched,
    /// A record joined the group.
    MemberAdded(Arc<Record>),
    /// A record left the group.
    MemberRemoved(Arc<Record>),
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Boxed async event handler.
pub type EventHandler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, TetherResult<()>> + Send + Sync>;

/// A typed event emitter with removable subscriptions.
pub struct EventBus<E> {
    handlers: Mutex<Vec<(SubscriptionId, EventHandler<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. It runs on every subsequent [`emit`](Self::emit).
    pub fn subscribe<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TetherResult<()>> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: EventHandler<E> = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every handler and wait for all of them.
    ///
    /// Handlers run concurrently. The first failure is returned; any further
    /// failures are logged.
    pub async fn emit(&self, event: E) -> TetherResult<()> {
        // Snapshot so handlers may (un)subscribe while running.
        let handlers: Vec<EventHandler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            return Ok(());
        }

        let results = join_all(handlers.iter().map(|handler| handler(event.clone()))).await;

        let mut first = None;
        for result in results {
            if let Err(e) = result {
                if first.is_none() {
                    first = Some(e);
                } else {
                    tracing::warn!(error = %e, "Additional event handler failure");
                }
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E> Default for EventBus<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .handlers
            .lock()
            .map(|handlers| handlers.len())
            .unwrap_or_default();
        f.debug_struct("EventBus")
            .field("subscribers", &count)
            .finish()
    }
}
