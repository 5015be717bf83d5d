//! Load balancing for tunnelgrid relays.
//!
//! A [`LoadBalancer`] owns a mutable pool of weighted, health-tracked
//! [`Backend`]s and selects one healthy backend per connection using a
//! pluggable strategy. Selection only reads; health state is mutated
//! exclusively through [`LoadBalancer::mark_failure`] and
//! [`LoadBalancer::mark_healthy`], called from connection-failure or
//! health-check paths.
//!
//! The balancer is `Send + Sync` and shared across tasks via
//! `Arc<LoadBalancer>`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tunnelgrid_core::defaults::DEFAULT_MAX_FAIL_COUNT;

// ── Errors ──

#[derive(Error, Debug)]
pub enum LbError {
    #[error("no backends available")]
    NoBackends,
}

// ── Strategy enum (for serde config) ──

/// Load balancing strategy identifier, used in configuration and rule
/// payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    Random,
    Weighted,
    LeastConn,
    IpHash,
}

// ── Backend ──

/// A single forwarding target with health and connection tracking state.
pub struct Backend {
    host: String,
    port: u16,
    weight: u32,
    healthy: AtomicBool,
    fail_count: AtomicU32,
    /// Live connection count (used by LeastConn).
    active_conns: AtomicUsize,
    /// When health state last changed (failure or recovery).
    last_check: RwLock<Instant>,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            healthy: AtomicBool::new(true),
            fail_count: AtomicU32::new(0),
            active_conns: AtomicUsize::new(0),
            last_check: RwLock::new(Instant::now()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// `host:port` form used in logs and failure reports.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn last_check(&self) -> Instant {
        *self.last_check.read()
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("addr", &self.addr())
            .field("weight", &self.weight)
            .field("healthy", &self.is_healthy())
            .field("fail_count", &self.fail_count())
            .field("active_conns", &self.active_connections())
            .finish()
    }
}

// ── Selection result ──

/// Result of a load balancer selection.
pub struct Selection {
    /// The selected backend.
    pub backend: Arc<Backend>,
    /// RAII guard tracking the live connection; hold for the connection's
    /// lifetime so LeastConn sees accurate counts.
    pub guard: ConnectionGuard,
}

/// Holds one slot in a backend's live connection count. Releasing happens
/// on drop, so the count stays correct even when the relay task aborts.
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    fn hold(backend: Arc<Backend>) -> Self {
        backend.active_conns.fetch_add(1, Ordering::Relaxed);
        Self { backend }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.active_conns.fetch_sub(1, Ordering::Relaxed);
    }
}

// ── Policy trait ──

/// A selection strategy over the healthy subset of the pool.
///
/// `healthy` is never empty when `select` is called. Returns an index into
/// `healthy`.
pub trait LbPolicy: Send + Sync + 'static {
    fn select(&self, healthy: &[Arc<Backend>], client_ip: &str) -> usize;
}

// ── LoadBalancer ──

/// Health-tracked backend pool with a pluggable selection strategy.
pub struct LoadBalancer {
    backends: RwLock<Vec<Arc<Backend>>>,
    policy: Box<dyn LbPolicy>,
    strategy: LbStrategy,
    max_fail_count: u32,
}

impl LoadBalancer {
    /// Create a balancer with the given strategy and the default fail
    /// threshold.
    pub fn new(strategy: LbStrategy) -> Self {
        Self::with_max_fail_count(strategy, DEFAULT_MAX_FAIL_COUNT)
    }

    /// Create a balancer with an explicit consecutive-failure threshold.
    pub fn with_max_fail_count(strategy: LbStrategy, max_fail_count: u32) -> Self {
        let policy: Box<dyn LbPolicy> = match strategy {
            LbStrategy::RoundRobin => Box::new(RoundRobin::new()),
            LbStrategy::Random => Box::new(Random),
            LbStrategy::Weighted => Box::new(Weighted::new()),
            LbStrategy::LeastConn => Box::new(LeastConn),
            LbStrategy::IpHash => Box::new(IpHash),
        };
        Self {
            backends: RwLock::new(Vec::new()),
            policy,
            strategy,
            max_fail_count: max_fail_count.max(1),
        }
    }

    pub fn strategy(&self) -> LbStrategy {
        self.strategy
    }

    /// Add a backend to the pool.
    pub fn add_backend(&self, host: impl Into<String>, port: u16, weight: u32) {
        self.backends
            .write()
            .push(Arc::new(Backend::new(host, port, weight)));
    }

    /// Remove all backends matching `host:port`. Returns how many were
    /// removed. In-flight connections to a removed backend are unaffected.
    pub fn remove_backend(&self, host: &str, port: u16) -> usize {
        let mut backends = self.backends.write();
        let before = backends.len();
        backends.retain(|b| !b.matches(host, port));
        before - backends.len()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.read().len()
    }

    /// Snapshot of the current pool for inspection.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    /// Select one healthy backend for a connection from `client_ip`.
    pub fn next(&self, client_ip: &str) -> Result<Selection, LbError> {
        let backends = self.backends.read();
        let healthy: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        drop(backends);

        if healthy.is_empty() {
            return Err(LbError::NoBackends);
        }

        let idx = self.policy.select(&healthy, client_ip);
        let backend = healthy[idx].clone();
        let guard = ConnectionGuard::hold(backend.clone());
        Ok(Selection { backend, guard })
    }

    /// Record a connection failure against `host:port`. The backend is
    /// marked unhealthy once its failure count reaches the threshold.
    pub fn mark_failure(&self, host: &str, port: u16) {
        let backends = self.backends.read();
        for backend in backends.iter() {
            if backend.matches(host, port) {
                let fails = backend.fail_count.fetch_add(1, Ordering::Relaxed) + 1;
                if fails >= self.max_fail_count {
                    backend.healthy.store(false, Ordering::Relaxed);
                }
                *backend.last_check.write() = Instant::now();
                return;
            }
        }
    }

    /// Reset `host:port` to healthy with a zero failure count.
    pub fn mark_healthy(&self, host: &str, port: u16) {
        let backends = self.backends.read();
        for backend in backends.iter() {
            if backend.matches(host, port) {
                backend.fail_count.store(0, Ordering::Relaxed);
                backend.healthy.store(true, Ordering::Relaxed);
                *backend.last_check.write() = Instant::now();
                return;
            }
        }
    }

    /// True when the pool is non-empty and every backend is unhealthy.
    /// Used by the node's failover monitor.
    pub fn all_unhealthy(&self) -> bool {
        let backends = self.backends.read();
        !backends.is_empty() && backends.iter().all(|b| !b.is_healthy())
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("backends", &*self.backends.read())
            .finish()
    }
}

// ── Built-in policies ──

/// Round-robin: an atomically-incremented counter modulo the healthy-set
/// size. Even rotation across concurrent callers without locking.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LbPolicy for RoundRobin {
    fn select(&self, healthy: &[Arc<Backend>], _client_ip: &str) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len()
    }
}

/// Uniform random pick.
pub struct Random;

impl LbPolicy for Random {
    fn select(&self, healthy: &[Arc<Backend>], _client_ip: &str) -> usize {
        rand::Rng::gen_range(&mut rand::thread_rng(), 0..healthy.len())
    }
}

/// Cumulative-weight draw. Falls back to round-robin when the total weight
/// is zero.
pub struct Weighted {
    fallback: RoundRobin,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            fallback: RoundRobin::new(),
        }
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl LbPolicy for Weighted {
    fn select(&self, healthy: &[Arc<Backend>], client_ip: &str) -> usize {
        let total: u64 = healthy.iter().map(|b| b.weight() as u64).sum();
        if total == 0 {
            return self.fallback.select(healthy, client_ip);
        }
        let mut draw = rand::Rng::gen_range(&mut rand::thread_rng(), 0..total);
        for (i, backend) in healthy.iter().enumerate() {
            let w = backend.weight() as u64;
            if draw < w {
                return i;
            }
            draw -= w;
        }
        // Unreachable for draw < total; defends against weight overflow.
        healthy.len() - 1
    }
}

/// Least live connections; ties broken by iteration order.
pub struct LeastConn;

impl LbPolicy for LeastConn {
    fn select(&self, healthy: &[Arc<Backend>], _client_ip: &str) -> usize {
        let mut min_idx = 0;
        let mut min_conns = healthy[0].active_connections();
        for (i, backend) in healthy.iter().enumerate().skip(1) {
            let conns = backend.active_connections();
            if conns < min_conns {
                min_conns = conns;
                min_idx = i;
            }
        }
        min_idx
    }
}

/// Polynomial hash of the client IP string modulo the healthy-set size.
/// Deterministic per client IP while the healthy pool is unchanged, giving
/// session affinity; assignments may reshuffle on topology changes.
pub struct IpHash;

impl LbPolicy for IpHash {
    fn select(&self, healthy: &[Arc<Backend>], client_ip: &str) -> usize {
        let mut hash: u64 = 0;
        for byte in client_ip.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
        }
        (hash % healthy.len() as u64) as usize
    }
}

// ── Tests ──
