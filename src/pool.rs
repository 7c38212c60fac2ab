use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Builds one pooled value. Invoked lazily, the first time a slot is
/// borrowed, and again whenever a previous value was dropped.
pub(crate) type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Applied to a value when its borrow is returned.
pub(crate) type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Checked on acquire; `true` disposes the value and builds a fresh one in
/// the same slot.
pub(crate) type ShouldDropFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// How often an empty pool re-checks for a returned slot.
const ACQUIRE_RETRY: Duration = Duration::from_millis(100);

/// Bounded pool of lazily constructed values.
///
/// The pool starts with `capacity` unrealised slots; a slot's value is built
/// by the factory on first borrow. Free slots form a LIFO stack, so a warm
/// value is preferred over realising a cold slot. The sum of free and
/// borrowed slots equals `capacity` for the pool's whole lifetime: a slot
/// whose factory fails goes back unrealised, and a borrowed slot returns on
/// guard drop.
pub(crate) struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<T> {
    capacity: usize,
    /// Each entry is one slot; `None` is an unrealised slot.
    free: Mutex<Vec<Option<T>>>,
    factory: Factory<T>,
    reset: Option<ResetFn<T>>,
    should_drop: Option<ShouldDropFn<T>>,
    shutdown: CancellationToken,
}

impl<T: Send + 'static> Pool<T> {
    pub(crate) fn new(
        capacity: usize,
        factory: Factory<T>,
        reset: Option<ResetFn<T>>,
        should_drop: Option<ShouldDropFn<T>>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut free = Vec::with_capacity(capacity);
        free.resize_with(capacity, || None);
        Pool {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(free),
                factory,
                reset,
                should_drop,
                shutdown,
            }),
        }
    }

    /// Borrows one slot, waiting up to `wait` for one to free up.
    ///
    /// The caller's token is honoured alongside the pool's own shutdown
    /// token for the entire wait, including an in-flight factory.
    pub(crate) async fn acquire(
        &self,
        wait: Option<Duration>,
        caller: &CancellationToken,
    ) -> Result<PoolGuard<T>> {
        let start = Instant::now();
        let slot = loop {
            if self.inner.shutdown.is_cancelled() || caller.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(slot) = self.pop_slot() {
                break slot;
            }
            if let Some(limit) = wait {
                if start.elapsed() >= limit {
                    return Err(Error::PoolTimeout(limit));
                }
            }
            tokio::select! {
                _ = sleep(ACQUIRE_RETRY) => {}
                _ = self.inner.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = caller.cancelled() => return Err(Error::Cancelled),
            }
        };

        let value = match slot {
            Some(existing) => {
                let broken = self
                    .inner
                    .should_drop
                    .as_ref()
                    .map_or(false, |check| check(&existing));
                if broken {
                    debug!("pooled value is broken; replacing it");
                    drop(existing);
                    self.realise(caller).await?
                } else {
                    existing
                }
            }
            None => self.realise(caller).await?,
        };

        Ok(PoolGuard {
            pool: Arc::clone(&self.inner),
            value: Some(value),
        })
    }

    /// Runs the factory for a slot the caller holds. On failure or
    /// cancellation the slot is reinstalled unrealised before returning.
    async fn realise(&self, caller: &CancellationToken) -> Result<T> {
        let build = (self.inner.factory)();
        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(Error::Cancelled),
            _ = caller.cancelled() => Err(Error::Cancelled),
            built = build => built,
        };
        match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                self.push_slot(None);
                Err(e)
            }
        }
    }

    fn pop_slot(&self) -> Option<Option<T>> {
        self.inner.free.lock().unwrap_or_else(|p| p.into_inner()).pop()
    }

    fn push_slot(&self, slot: Option<T>) {
        self.inner.push_slot(slot);
    }

    /// Cancels in-flight factories and drops every realised free value.
    /// Outstanding borrows are dropped when their guards return.
    pub(crate) fn dispose(&self) {
        self.inner.shutdown.cancel();
        let mut free = self.inner.free.lock().unwrap_or_else(|p| p.into_inner());
        for slot in free.iter_mut() {
            *slot = None;
        }
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

impl<T> PoolInner<T> {
    fn push_slot(&self, slot: Option<T>) {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        debug_assert!(free.len() < self.capacity);
        free.push(slot);
    }
}

/// Exclusive borrow of one pooled value; dropping it returns the slot.
pub(crate) struct PoolGuard<T> {
    pool: Arc<PoolInner<T>>,
    value: Option<T>,
}

impl<T> std::fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pool guard value present until drop")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pool guard value present until drop")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(mut value) = self.value.take() {
            if self.pool.shutdown.is_cancelled() {
                // disposed pool: the value is closed, the slot stays empty
                drop(value);
                self.pool.push_slot(None);
                return;
            }
            if let Some(reset) = self.pool.reset.as_ref() {
                reset(&mut value);
            }
            self.pool.push_slot(Some(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Widget {
        broken: Arc<AtomicBool>,
    }

    fn counting_factory(
        built: Arc<AtomicUsize>,
        fail_first: usize,
    ) -> (Factory<Widget>, Arc<AtomicUsize>) {
        let failures = Arc::new(AtomicUsize::new(fail_first));
        let failures_in_factory = Arc::clone(&failures);
        let factory: Factory<Widget> = Arc::new(move || {
            let built = Arc::clone(&built);
            let failures = Arc::clone(&failures_in_factory);
            Box::pin(async move {
                if failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(Error::proxy("factory failure"));
                }
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Widget {
                    broken: Arc::new(AtomicBool::new(false)),
                })
            })
        });
        (factory, failures)
    }

    fn pool_of(capacity: usize, factory: Factory<Widget>) -> Pool<Widget> {
        Pool::new(
            capacity,
            factory,
            None,
            Some(Box::new(|w: &Widget| w.broken.load(Ordering::SeqCst))),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_capacity_is_conserved() {
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 0);
        let pool = pool_of(2, factory);
        let none = CancellationToken::new();

        let a = pool.acquire(None, &none).await.unwrap();
        let b = pool.acquire(None, &none).await.unwrap();
        assert_eq!(pool.free_len(), 0);

        let err = pool
            .acquire(Some(Duration::from_millis(250)), &none)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolTimeout(_)));

        drop(a);
        assert_eq!(pool.free_len(), 1);
        let c = pool.acquire(None, &none).await.unwrap();
        drop(b);
        drop(c);
        assert_eq!(pool.free_len(), 2);
    }

    #[tokio::test]
    async fn test_factory_runs_once_per_slot() {
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 0);
        let pool = pool_of(1, factory);
        let none = CancellationToken::new();

        for _ in 0..5 {
            let guard = pool.acquire(None, &none).await.unwrap();
            drop(guard);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_value_is_replaced() {
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 0);
        let pool = pool_of(1, factory);
        let none = CancellationToken::new();

        let guard = pool.acquire(None, &none).await.unwrap();
        guard.broken.store(true, Ordering::SeqCst);
        drop(guard);

        let replacement = pool.acquire(None, &none).await.unwrap();
        assert!(!replacement.broken.load(Ordering::SeqCst));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_factory_reinstalls_slot() {
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 1);
        let pool = pool_of(1, factory);
        let none = CancellationToken::new();

        let err = pool.acquire(None, &none).await.unwrap_err();
        assert!(matches!(err, Error::Proxy { .. }));
        assert_eq!(pool.free_len(), 1);

        // the slot is usable again and the factory retried
        let guard = pool.acquire(None, &none).await.unwrap();
        drop(guard);
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_runs_on_release() {
        let resets = Arc::new(AtomicUsize::new(0));
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 0);
        let reset_counter = Arc::clone(&resets);
        let pool = Pool::new(
            1,
            factory,
            Some(Box::new(move |_w: &mut Widget| {
                reset_counter.fetch_add(1, Ordering::SeqCst);
            })),
            None,
            CancellationToken::new(),
        );
        let none = CancellationToken::new();

        drop(pool.acquire(None, &none).await.unwrap());
        drop(pool.acquire(None, &none).await.unwrap());
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_caller_cancellation_during_wait() {
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 0);
        let pool = pool_of(1, factory);
        let none = CancellationToken::new();

        let held = pool.acquire(None, &none).await.unwrap();

        let caller = CancellationToken::new();
        let waiting = pool.acquire(None, &caller);
        tokio::pin!(waiting);

        tokio::select! {
            _ = &mut waiting => panic!("acquire should still be waiting"),
            _ = sleep(Duration::from_millis(150)) => {}
        }
        caller.cancel();
        assert!(matches!(waiting.await, Err(Error::Cancelled)));
        drop(held);
    }

    #[tokio::test]
    async fn test_dispose_cancels_waiters() {
        let built = Arc::new(AtomicUsize::new(0));
        let (factory, _) = counting_factory(Arc::clone(&built), 0);
        let pool = pool_of(1, factory);
        let none = CancellationToken::new();

        let held = pool.acquire(None, &none).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                pool.acquire(None, &token).await
            })
        };
        sleep(Duration::from_millis(50)).await;
        pool.dispose();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        drop(held);
    }
}
