//! Async mutual exclusion for completion handlers.
//!
//! At most one holder is inside the critical section at a time. The guard
//! may be held across `.await` points. Waiters are not served in any
//! particular order.

use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Binary async lock serializing orchestrator state transitions.
#[derive(Debug, Default)]
pub struct DispatchLock {
    inner: Mutex<()>,
}

/// Proof of holding the [`DispatchLock`]. Releases on drop.
#[derive(Debug)]
pub struct DispatchGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl DispatchLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the critical section.
    pub async fn acquire(&self) -> DispatchGuard<'_> {
        let waited = Instant::now();
        let guard = self.inner.lock().await;
        trace!(wait_us = waited.elapsed().as_micros() as u64, "dispatch lock acquired");
        DispatchGuard { _guard: guard }
    }

    /// Enter the critical section only if it is free.
    pub fn try_acquire(&self) -> Option<DispatchGuard<'_>> {
        self.inner
            .try_lock()
            .ok()
            .map(|guard| DispatchGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_acquire_while_held() {
        let lock = DispatchLock::new();
        let guard = lock.acquire().await;
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_holder_across_await() {
        let lock = Arc::new(DispatchLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _guard = lock.acquire().await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
