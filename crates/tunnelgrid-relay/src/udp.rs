//! UDP relay with per-client session tracking.
//!
//! Datagrams arriving on the listen socket are demultiplexed by client
//! address. Each client gets a session with its own upstream socket
//! connected to the target; a reverse task pumps target replies back out
//! through the listen socket. Sessions die by idle timeout, observed both
//! by the reverse task and by a periodic sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelgrid_core::defaults;
use tunnelgrid_core::stats::{ActiveGuard, RelayStats};
use tunnelgrid_lb::{LoadBalancer, Selection};

use crate::config::RelayConfig;
use crate::error::RelayError;

/// One tracked client session.
struct UdpSession {
    client_addr: SocketAddr,
    target: Arc<UdpSocket>,
    last_active: RwLock<Instant>,
    reverse: Mutex<Option<JoinHandle<()>>>,
    _active: ActiveGuard,
    /// Holds the backend's connection slot while balancing.
    _selection: Option<Selection>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }
}

/// One UDP relay instance.
pub struct UdpRelay {
    config: RelayConfig,
    balancer: Option<Arc<LoadBalancer>>,
    stats: Arc<RelayStats>,
    sessions: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
    running: AtomicBool,
    shutdown: RwLock<Option<CancellationToken>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl UdpRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            balancer: None,
            stats: Arc::new(RelayStats::new()),
            sessions: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: RwLock::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Relay whose upstream is selected per session by `balancer`.
    pub fn with_balancer(config: RelayConfig, balancer: Arc<LoadBalancer>) -> Self {
        let mut relay = Self::new(config);
        relay.balancer = Some(balancer);
        relay
    }

    /// Actual bound address, useful when the config asked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Bind the listen socket and spawn the datagram loop plus the idle
    /// sweep task.
    pub async fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RelayError::AlreadyRunning);
        }
        if let Err(e) = self.config.validate() {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        let socket = match UdpSocket::bind(self.config.listen()).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        *self.local_addr.write() = socket.local_addr().ok();

        let token = CancellationToken::new();
        *self.shutdown.write() = Some(token.clone());

        info!(
            relay = %self.config.name,
            listen = %self.config.listen(),
            target = %self.config.target(),
            "udp relay started"
        );

        let relay = self.clone();
        let loop_token = token.clone();
        let loop_socket = socket.clone();
        tokio::spawn(async move {
            relay.datagram_loop(loop_socket, loop_token).await;
        });

        let relay = self.clone();
        tokio::spawn(async move {
            relay.sweep_loop(token).await;
        });
        Ok(())
    }

    async fn datagram_loop(self: Arc<Self>, socket: Arc<UdpSocket>, token: CancellationToken) {
        let mut buf = vec![0u8; self.config.buffer_size()];
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(relay = %self.config.name, "datagram loop stopping");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, client_addr) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(relay = %self.config.name, error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    let session = match self.get_or_create_session(client_addr, &socket).await {
                        Some(session) => session,
                        None => continue,
                    };

                    session.touch();
                    match session.target.send(&buf[..n]).await {
                        Ok(sent) => {
                            self.stats.add_bytes_in(sent as u64);
                            tunnelgrid_metrics::record_bytes_in(sent as u64);
                        }
                        Err(e) => {
                            debug!(
                                relay = %self.config.name,
                                client = %client_addr,
                                error = %e,
                                "forward to target failed"
                            );
                            self.remove_session(client_addr, false);
                        }
                    }
                }
            }
        }
    }

    async fn get_or_create_session(
        self: &Arc<Self>,
        client_addr: SocketAddr,
        main_socket: &Arc<UdpSocket>,
    ) -> Option<Arc<UdpSession>> {
        if let Some(session) = self.sessions.read().get(&client_addr) {
            return Some(session.clone());
        }

        if self.config.max_connections > 0
            && self.sessions.read().len() as u64 >= self.config.max_connections
        {
            self.stats.record_failed();
            tunnelgrid_metrics::record_connection_failed(
                tunnelgrid_metrics::REASON_SESSION_LIMIT,
            );
            warn!(
                relay = %self.config.name,
                client = %client_addr,
                limit = self.config.max_connections,
                "session limit reached, dropping datagram"
            );
            return None;
        }

        // The whole session sticks to one backend; rebalancing mid-flow
        // would break request/reply pairing for connectionless protocols.
        let selection = match &self.balancer {
            Some(balancer) => match balancer.next(&client_addr.ip().to_string()) {
                Ok(selection) => Some(selection),
                Err(e) => {
                    self.stats.record_failed();
                    tunnelgrid_metrics::record_connection_failed(
                        tunnelgrid_metrics::REASON_NO_BACKEND,
                    );
                    warn!(relay = %self.config.name, client = %client_addr, error = %e, "no upstream");
                    return None;
                }
            },
            None => None,
        };
        let target_addr = selection
            .as_ref()
            .map(|s| s.backend.addr())
            .unwrap_or_else(|| self.config.target());

        let target = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                self.stats.record_failed();
                warn!(relay = %self.config.name, error = %e, "upstream socket bind failed");
                return None;
            }
        };
        if let Err(e) = target.connect(&target_addr).await {
            self.stats.record_failed();
            tunnelgrid_metrics::record_connection_failed(tunnelgrid_metrics::REASON_DIAL);
            if let (Some(balancer), Some(selection)) = (&self.balancer, &selection) {
                balancer.mark_failure(selection.backend.host(), selection.backend.port());
            }
            warn!(
                relay = %self.config.name,
                target = %target_addr,
                error = %e,
                "upstream connect failed"
            );
            return None;
        }

        let session = Arc::new(UdpSession {
            client_addr,
            target: Arc::new(target),
            last_active: RwLock::new(Instant::now()),
            reverse: Mutex::new(None),
            _active: self.stats.connection_started(),
            _selection: selection,
        });
        tunnelgrid_metrics::record_connection_accepted();
        tunnelgrid_metrics::record_udp_session_opened();

        let handle = tokio::spawn(
            self.clone()
                .reverse_loop(session.clone(), main_socket.clone()),
        );
        *session.reverse.lock() = Some(handle);

        self.sessions.write().insert(client_addr, session.clone());
        debug!(relay = %self.config.name, client = %client_addr, "udp session opened");
        Some(session)
    }

    /// Pump target replies back to the client until the session goes idle
    /// or the upstream socket errors.
    async fn reverse_loop(
        self: Arc<Self>,
        session: Arc<UdpSession>,
        main_socket: Arc<UdpSocket>,
    ) {
        let idle_timeout = self.config.idle_timeout();
        let mut buf = vec![0u8; self.config.buffer_size()];
        loop {
            match tokio::time::timeout(idle_timeout, session.target.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    session.touch();
                    match main_socket.send_to(&buf[..n], session.client_addr).await {
                        Ok(sent) => {
                            self.stats.add_bytes_out(sent as u64);
                            tunnelgrid_metrics::record_bytes_out(sent as u64);
                        }
                        Err(e) => {
                            debug!(
                                relay = %self.config.name,
                                client = %session.client_addr,
                                error = %e,
                                "reply to client failed"
                            );
                            self.remove_session(session.client_addr, false);
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(
                        relay = %self.config.name,
                        client = %session.client_addr,
                        error = %e,
                        "upstream recv failed"
                    );
                    self.remove_session(session.client_addr, false);
                    return;
                }
                Err(_) => {
                    // The recv deadline alone is not idleness; forward
                    // traffic also refreshes the session.
                    if session.idle_for() >= idle_timeout {
                        self.remove_session(session.client_addr, true);
                        return;
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, token: CancellationToken) {
        let idle_timeout = self.config.idle_timeout();
        let mut interval =
            tokio::time::interval(Duration::from_secs(defaults::UDP_SWEEP_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let expired: Vec<SocketAddr> = self
                        .sessions
                        .read()
                        .values()
                        .filter(|s| s.idle_for() >= idle_timeout)
                        .map(|s| s.client_addr)
                        .collect();
                    for addr in expired {
                        self.remove_session(addr, true);
                    }
                }
            }
        }
    }

    /// Remove a session. Safe to call from the sweep and the reverse task
    /// concurrently; whichever caller wins the map removal does the
    /// accounting and the other is a no-op.
    fn remove_session(&self, client_addr: SocketAddr, reaped: bool) {
        let removed = self.sessions.write().remove(&client_addr);
        if let Some(session) = removed {
            if let Some(handle) = session.reverse.lock().take() {
                handle.abort();
            }
            tunnelgrid_metrics::record_connection_closed();
            tunnelgrid_metrics::record_udp_session_closed(reaped);
            debug!(
                relay = %self.config.name,
                client = %client_addr,
                reaped,
                "udp session closed"
            );
        }
    }

    /// Cancel the datagram loop and tear down all sessions.
    pub async fn stop(&self) -> Result<(), RelayError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RelayError::NotRunning);
        }

        if let Some(token) = self.shutdown.write().take() {
            token.cancel();
        }

        let addrs: Vec<SocketAddr> = self.sessions.read().keys().copied().collect();
        for addr in addrs {
            self.remove_session(addr, false);
        }

        self.running.store(false, Ordering::Release);
        info!(relay = %self.config.name, "udp relay stopped");
        Ok(())
    }
}
