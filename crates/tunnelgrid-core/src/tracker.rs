//! In-flight connection tracking for graceful drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Tracks in-flight connections so `stop()` can wait for them to drain.
#[derive(Clone)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    zero_notify: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            zero_notify: Arc::new(Notify::new()),
        }
    }

    pub fn track(&self) -> TrackerGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        TrackerGuard {
            tracker: self.clone(),
        }
    }

    fn release(&self) {
        // AcqRel: Acquire to see previous increments, Release to make the
        // decrement visible before notifying waiters.
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero_notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no connections remain, up to `timeout`. Returns whether
    /// the count actually reached zero.
    pub async fn wait_for_zero(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = self.zero_notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return self.count() == 0,
            }
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases its tracker slot on drop.
pub struct TrackerGuard {
    tracker: ConnectionTracker,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_zero_returns_when_drained() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();
        assert_eq!(tracker.count(), 1);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_zero(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_zero_times_out() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();
        assert!(!tracker.wait_for_zero(Duration::from_millis(30)).await);
    }
}
