use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// A wait that can be swapped for a manual one in tests.
pub trait Delay: Send + Sync {
    fn wait(&self) -> BoxFuture<'_, ()>;

    /// True if `wait` resolves immediately.
    fn is_zero(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct TimerDelay {
    duration: Duration,
}

impl TimerDelay {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Delay for TimerDelay {
    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(self.duration))
    }

    fn is_zero(&self) -> bool {
        self.duration.is_zero()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn is_zero(&self) -> bool {
        true
    }
}

/// Resolves one pending or future `wait` per `tick`.
#[derive(Debug)]
pub struct FakeDelay {
    permits: Semaphore,
    waiters: AtomicUsize,
}

impl FakeDelay {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn tick(&self) {
        self.permits.add_permits(1);
    }

    /// Number of `wait` futures currently blocked.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

impl Default for FakeDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Delay for FakeDelay {
    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.waiters.fetch_add(1, Ordering::SeqCst);
            let _waiting = WaiterGuard(&self.waiters);
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
        })
    }

    fn is_zero(&self) -> bool {
        false
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
