//! Per-key write serialization.
//!
//! At most one write per cache key is in flight. A write requested while
//! another is running for the same key waits in a single pending slot; a
//! newer request replaces the pending job, and every caller whose request
//! was replaced receives the result of the job that replaced it. Jobs build
//! their payload when they start, so the write that finally lands carries
//! the latest entity state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use tether_core::StoreError;
use tokio::sync::oneshot;

use crate::store::StoreResult;

type WriteJob = Box<dyn FnOnce() -> BoxFuture<'static, StoreResult<()>> + Send>;

struct Pending {
    job: WriteJob,
    waiters: Vec<oneshot::Sender<StoreResult<()>>>,
}

/// State of a key with a write in flight.
#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
}

/// Serializes writes per key and coalesces queued ones.
#[derive(Default)]
pub struct KeyedWriteQueue {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedWriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a write in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Callers waiting on the pending write for `key`.
    pub fn queued(&self, key: &str) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|slot| slot.pending.as_ref())
            .map_or(0, |pending| pending.waiters.len())
    }

    /// Run `job` for `key` once no other write for `key` is in flight.
    ///
    /// The caller that finds the key idle drives it: it runs its own job and
    /// then every job queued behind it until the key is idle again.
    pub async fn run<F, Fut>(&self, key: &str, job: F) -> StoreResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<()>> + Send + 'static,
    {
        let job: WriteJob = Box::new(move || Box::pin(job()));

        let (job, waiter) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get_mut(key) {
                Some(slot) => {
                    let (tx, rx) = oneshot::channel();
                    match slot.pending.as_mut() {
                        Some(pending) => {
                            pending.job = job;
                            pending.waiters.push(tx);
                            tracing::trace!(
                                key = %key,
                                waiters = pending.waiters.len(),
                                "Coalesced pending cache write"
                            );
                        }
                        None => {
                            slot.pending = Some(Pending {
                                job,
                                waiters: vec![tx],
                            });
                        }
                    }
                    (None, Some(rx))
                }
                None => {
                    slots.insert(key.to_string(), Slot::default());
                    (Some(job), None)
                }
            }
        };

        if let Some(rx) = waiter {
            return rx.await.unwrap_or_else(|_| {
                Err(StoreError::Superseded {
                    key: key.to_string(),
                })
            });
        }

        let mut guard = DriverGuard {
            queue: self,
            key,
            armed: true,
        };

        let result = match job {
            Some(job) => job().await,
            None => Ok(()),
        };

        loop {
            let next = {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                let pending = slots.get_mut(key).and_then(|slot| slot.pending.take());
                if pending.is_none() {
                    slots.remove(key);
                    guard.armed = false;
                }
                pending
            };

            let Some(Pending { job, waiters }) = next else {
                break;
            };

            // A failure here belongs to the callers that were coalesced into
            // this job, not to the driver.
            let outcome = job().await;
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }

        result
    }
}

/// Frees the key if the driving future is dropped mid-write. Queued callers
/// then see [`StoreError::Superseded`].
struct DriverGuard<'a> {
    queue: &'a KeyedWriteQueue,
    key: &'a str,
    armed: bool,
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.key);
        }
    }
}

impl std::fmt::Debug for KeyedWriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedWriteQueue")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_idle_key_runs_immediately() {
        let queue = KeyedWriteQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        queue
            .run("k", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queued_writes_coalesce_to_latest() {
        let queue = Arc::new(KeyedWriteQueue::new());
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let queue = Arc::clone(&queue);
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                queue
                    .run("k", move || async move {
                        gate.notified().await;
                        log.lock().unwrap().push(1);
                        Ok(())
                    })
                    .await
            })
        };
        while queue.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let mut queued = Vec::new();
        for n in 2..=4 {
            let queue = Arc::clone(&queue);
            let log = Arc::clone(&log);
            let waiting = Arc::clone(&queue);
            queued.push(tokio::spawn(async move {
                queue
                    .run("k", move || async move {
                        log.lock().unwrap().push(n);
                        Ok(())
                    })
                    .await
            }));
            while waiting.queued("k") < n - 1 {
                tokio::task::yield_now().await;
            }
        }

        gate.notify_one();
        first.await.unwrap().unwrap();
        for handle in queued {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec![1, 4]);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_coalesced_waiters_receive_failure() {
        let queue = Arc::new(KeyedWriteQueue::new());
        let gate = Arc::new(Notify::new());

        let first = {
            let queue = Arc::clone(&queue);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                queue
                    .run("k", move || async move {
                        gate.notified().await;
                        Ok(())
                    })
                    .await
            })
        };
        while queue.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let second = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .run("k", || async {
                        Err(StoreError::WriteFailed {
                            key: "k".to_string(),
                            reason: "disk full".to_string(),
                        })
                    })
                    .await
            })
        };
        while queue.queued("k") == 0 {
            tokio::task::yield_now().await;
        }

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert!(matches!(
            second.await.unwrap(),
            Err(StoreError::WriteFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_wait() {
        let queue = Arc::new(KeyedWriteQueue::new());
        let gate = Arc::new(Notify::new());

        let blocked = {
            let queue = Arc::clone(&queue);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                queue
                    .run("a", move || async move {
                        gate.notified().await;
                        Ok(())
                    })
                    .await
            })
        };
        while queue.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        queue.run("b", || async { Ok(()) }).await.unwrap();
        assert!(queue.is_in_flight("a"));
        assert!(!queue.is_in_flight("b"));

        gate.notify_one();
        blocked.await.unwrap().unwrap();
    }
}
