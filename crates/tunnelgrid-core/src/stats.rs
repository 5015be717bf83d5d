//! Relay statistics counters.
//!
//! Counters are monotonic and read concurrently via atomics. They are never
//! reset implicitly; `reset` exists only for explicit operator action.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Shared counters for one relay instance.
#[derive(Debug)]
pub struct RelayStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    total_conns: AtomicU64,
    active_conns: AtomicU64,
    failed_conns: AtomicU64,
    /// Unix timestamp of relay start (set once at construction).
    start_time: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            total_conns: AtomicU64::new(0),
            active_conns: AtomicU64::new(0),
            failed_conns: AtomicU64::new(0),
            start_time: AtomicU64::new(unix_now()),
        }
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_conns.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a new connection and return a guard holding the active slot.
    pub fn connection_started(self: &Arc<Self>) -> ActiveGuard {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            stats: self.clone(),
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn total_conns(&self) -> u64 {
        self.total_conns.load(Ordering::Relaxed)
    }

    pub fn active_conns(&self) -> u64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn failed_conns(&self) -> u64 {
        self.failed_conns.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            total_conns: self.total_conns(),
            active_conns: self.active_conns(),
            failed_conns: self.failed_conns(),
            start_time: self.start_time.load(Ordering::Relaxed),
        }
    }

    /// Explicit operator reset. Active connection count is preserved since
    /// guards for in-flight connections will still decrement it.
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.total_conns.store(0, Ordering::Relaxed);
        self.failed_conns.store(0, Ordering::Relaxed);
        self.start_time.store(unix_now(), Ordering::Relaxed);
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that releases the active-connection slot on drop, so the
/// count stays accurate even if a connection task panics.
pub struct ActiveGuard {
    stats: Arc<RelayStats>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active_conns.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Direct byte accounting into the stats counters, for relays that need no
/// additional metrics backend.
impl crate::io::RelayMetrics for RelayStats {
    fn record_forward(&self, bytes: u64) {
        self.add_bytes_in(bytes);
    }
    fn record_reverse(&self, bytes: u64) {
        self.add_bytes_out(bytes);
    }
}

/// Serializable snapshot of relay counters for stats reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub total_conns: u64,
    pub active_conns: u64,
    pub failed_conns: u64,
    pub start_time: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Arc::new(RelayStats::new());
        stats.add_bytes_in(100);
        stats.add_bytes_in(50);
        stats.add_bytes_out(25);
        assert_eq!(stats.bytes_in(), 150);
        assert_eq!(stats.bytes_out(), 25);
    }

    #[test]
    fn active_guard_releases_on_drop() {
        let stats = Arc::new(RelayStats::new());
        let g1 = stats.connection_started();
        let g2 = stats.connection_started();
        assert_eq!(stats.active_conns(), 2);
        assert_eq!(stats.total_conns(), 2);
        drop(g1);
        assert_eq!(stats.active_conns(), 1);
        drop(g2);
        assert_eq!(stats.active_conns(), 0);
        // total is monotonic
        assert_eq!(stats.total_conns(), 2);
    }

    #[test]
    fn reset_clears_monotonic_counters() {
        let stats = Arc::new(RelayStats::new());
        stats.add_bytes_in(10);
        stats.record_failed();
        let _g = stats.connection_started();
        stats.reset();
        assert_eq!(stats.bytes_in(), 0);
        assert_eq!(stats.failed_conns(), 0);
        assert_eq!(stats.total_conns(), 0);
        // active survives reset; the guard still owns its slot
        assert_eq!(stats.active_conns(), 1);
    }
}
