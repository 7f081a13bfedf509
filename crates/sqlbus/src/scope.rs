//! Per-operation transaction scope.
//!
//! The scope is the callback bag the bus runtime carries through a message
//! handler: ordered on-commit / on-abort / on-dispose callbacks plus a
//! string-keyed item map. The transport parks its outbound buffer in the
//! item map and registers ack/nack work as callbacks; `complete()` runs the
//! commit callbacks in registration order, `abort()` runs the abort
//! callbacks. Completion is idempotent: whichever of the two happens first
//! wins and the other becomes a no-op.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::BusError;

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BusError>> + Send>;

const OPEN: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

#[derive(Default)]
pub struct TransactionScope {
    items: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    on_committed: Mutex<Vec<Callback>>,
    on_aborted: Mutex<Vec<Callback>>,
    on_disposed: Mutex<Vec<Callback>>,
    state: AtomicU8,
}

impl TransactionScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether neither `complete()` nor `abort()` has run yet.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Fetch the item under `key`, creating it with `init` on first access.
    /// Returns the item and whether this call created it.
    pub fn item_or_insert_with<T, F>(&self, key: &str, init: F) -> (Arc<T>, bool)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut items = self.items.lock();
        if let Some(existing) = items.get(key) {
            let item = existing
                .clone()
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("scope item '{key}' has an unexpected type"));
            return (item, false);
        }
        let item = Arc::new(init());
        items.insert(key.to_string(), item.clone());
        (item, true)
    }

    /// Fetch the item under `key` if present.
    pub fn item<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.items
            .lock()
            .get(key)
            .and_then(|item| item.clone().downcast::<T>().ok())
    }

    /// Run `callback` when the scope commits, after all callbacks registered
    /// before it. A failing commit callback fails the commit.
    pub fn on_committed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.on_committed
            .lock()
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Run `callback` when the scope aborts. Errors are logged, never
    /// rethrown, so they cannot mask the handler outcome that caused the
    /// abort.
    pub fn on_aborted<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.on_aborted
            .lock()
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Run `callback` after the scope finishes either way.
    pub fn on_disposed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.on_disposed
            .lock()
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Commit the scope: run commit callbacks in registration order, then
    /// dispose callbacks. The first commit-callback error aborts the rest
    /// and is returned. Calling `complete()` again (or after `abort()`) is
    /// a no-op.
    pub async fn complete(&self) -> Result<(), BusError> {
        if self
            .state
            .compare_exchange(OPEN, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("scope already completed, ignoring complete()");
            return Ok(());
        }

        let callbacks = std::mem::take(&mut *self.on_committed.lock());
        let mut result = Ok(());
        for callback in callbacks {
            if let Err(e) = callback().await {
                result = Err(e);
                break;
            }
        }
        self.run_disposed().await;
        result
    }

    /// Abort the scope: run abort callbacks (log-and-swallow), then dispose
    /// callbacks. A no-op if the scope already finished.
    pub async fn abort(&self) {
        if self
            .state
            .compare_exchange(OPEN, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("scope already completed, ignoring abort()");
            return;
        }

        for callback in std::mem::take(&mut *self.on_aborted.lock()) {
            if let Err(e) = callback().await {
                warn!(error = %e, "scope abort callback failed");
            }
        }
        self.run_disposed().await;
    }

    async fn run_disposed(&self) {
        for callback in std::mem::take(&mut *self.on_disposed.lock()) {
            if let Err(e) = callback().await {
                warn!(error = %e, "scope dispose callback failed");
            }
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != OPEN {
            return;
        }
        // The scope was dropped without completing: treat it as an abort so
        // leases get released. Drop is sync, so the callbacks run on a
        // spawned task when a runtime is available.
        let aborted = std::mem::take(&mut *self.on_aborted.lock());
        let disposed = std::mem::take(&mut *self.on_disposed.lock());
        if aborted.is_empty() && disposed.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for callback in aborted.into_iter().chain(disposed) {
                        if let Err(e) = callback().await {
                            warn!(error = %e, "scope cleanup callback failed");
                        }
                    }
                });
            }
            Err(_) => {
                warn!("scope dropped without completion outside a runtime; abort callbacks were skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn commit_callbacks_run_in_registration_order() {
        let scope = TransactionScope::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scope.on_committed(move || async move {
                order.lock().push(i);
                Ok(())
            });
        }

        scope.complete().await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let scope = TransactionScope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scope.on_committed(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        scope.complete().await.unwrap();
        scope.complete().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_after_complete_is_a_no_op() {
        let scope = TransactionScope::new();
        let aborted = Arc::new(AtomicUsize::new(0));
        let a = aborted.clone();
        scope.on_aborted(move || async move {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        scope.complete().await.unwrap();
        scope.abort().await;
        assert_eq!(aborted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_commit_callback_skips_the_rest_but_disposes() {
        let scope = TransactionScope::new();
        let ran_second = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));

        scope.on_committed(|| async {
            Err(BusError::Persistence {
                reason: "flush failed".into(),
                source: None,
            })
        });
        let r = ran_second.clone();
        scope.on_committed(move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let d = disposed.clone();
        scope.on_disposed(move || async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(scope.complete().await.is_err());
        assert_eq!(ran_second.load(Ordering::SeqCst), 0);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_swallows_callback_errors() {
        let scope = TransactionScope::new();
        let second_ran = Arc::new(AtomicUsize::new(0));

        scope.on_aborted(|| async {
            Err(BusError::Persistence {
                reason: "clear failed".into(),
                source: None,
            })
        });
        let s = second_ran.clone();
        scope.on_aborted(move || async move {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        scope.abort().await;
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn items_are_created_once() {
        let scope = TransactionScope::new();
        let (first, created) = scope.item_or_insert_with("buffer", || Mutex::new(vec![1]));
        assert!(created);
        first.lock().push(2);

        let (second, created) = scope.item_or_insert_with("buffer", || Mutex::new(Vec::<i32>::new()));
        assert!(!created);
        assert_eq!(*second.lock(), vec![1, 2]);

        assert!(scope.item::<Mutex<Vec<i32>>>("buffer").is_some());
        assert!(scope.item::<Mutex<Vec<i32>>>("missing").is_none());
    }

    #[tokio::test]
    async fn dropping_an_open_scope_runs_abort_callbacks() {
        let aborted = Arc::new(AtomicUsize::new(0));
        {
            let scope = TransactionScope::new();
            let a = aborted.clone();
            scope.on_aborted(move || async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        // The cleanup runs on a spawned task.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }
}
