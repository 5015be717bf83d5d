//! TCP relay: accept, dial the target, bridge bidirectionally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelgrid_core::defaults;
use tunnelgrid_core::io::{relay_bidirectional, CopyTuning, RelayMetrics, Throttle};
use tunnelgrid_core::stats::RelayStats;
use tunnelgrid_core::tracker::ConnectionTracker;
use tunnelgrid_lb::{LoadBalancer, Selection};

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Byte accounting for one TCP connection: per-relay stats plus the
/// process-wide Prometheus counters.
struct ConnMetrics {
    stats: Arc<RelayStats>,
}

impl RelayMetrics for ConnMetrics {
    fn record_forward(&self, bytes: u64) {
        self.stats.add_bytes_in(bytes);
        tunnelgrid_metrics::record_bytes_in(bytes);
    }
    fn record_reverse(&self, bytes: u64) {
        self.stats.add_bytes_out(bytes);
        tunnelgrid_metrics::record_bytes_out(bytes);
    }
}

/// One TCP relay instance. `start` binds the listener and spawns the accept
/// loop; `stop` cancels it and drains in-flight connections.
pub struct TcpRelay {
    config: RelayConfig,
    /// When present, the upstream is chosen per connection; the config
    /// target is only the fallback for single-target rules.
    balancer: Option<Arc<LoadBalancer>>,
    stats: Arc<RelayStats>,
    tracker: ConnectionTracker,
    running: AtomicBool,
    shutdown: RwLock<Option<CancellationToken>>,
    local_addr: RwLock<Option<std::net::SocketAddr>>,
}

impl TcpRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            balancer: None,
            stats: Arc::new(RelayStats::new()),
            tracker: ConnectionTracker::new(),
            running: AtomicBool::new(false),
            shutdown: RwLock::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Relay whose upstream is selected per connection by `balancer`.
    pub fn with_balancer(config: RelayConfig, balancer: Arc<LoadBalancer>) -> Self {
        let mut relay = Self::new(config);
        relay.balancer = Some(balancer);
        relay
    }

    /// Actual bound address, useful when the config asked for port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
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

    /// Bind the listen socket and spawn the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RelayError::AlreadyRunning);
        }
        self.config.validate().inspect_err(|_| {
            self.running.store(false, Ordering::Release);
        })?;

        let listener = match TcpListener::bind(self.config.listen()).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        *self.local_addr.write() = listener.local_addr().ok();

        let token = CancellationToken::new();
        *self.shutdown.write() = Some(token.clone());

        info!(
            relay = %self.config.name,
            listen = %self.config.listen(),
            target = %self.config.target(),
            "tcp relay started"
        );

        let relay = self.clone();
        tokio::spawn(async move {
            relay.accept_loop(listener, token).await;
        });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(relay = %self.config.name, "accept loop stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let (client, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(relay = %self.config.name, error = %e, "accept failed");
                            continue;
                        }
                    };

                    if self.config.max_connections > 0
                        && self.stats.active_conns() >= self.config.max_connections
                    {
                        self.stats.record_failed();
                        tunnelgrid_metrics::record_connection_failed(
                            tunnelgrid_metrics::REASON_CAPACITY,
                        );
                        warn!(
                            relay = %self.config.name,
                            peer = %peer,
                            limit = self.config.max_connections,
                            "connection limit reached, rejecting"
                        );
                        drop(client);
                        continue;
                    }

                    let relay = self.clone();
                    let conn_token = token.clone();
                    tokio::spawn(async move {
                        relay.handle_connection(client, conn_token).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, client: TcpStream, token: CancellationToken) {
        let _slot = self.tracker.track();
        let _active = self.stats.connection_started();
        tunnelgrid_metrics::record_connection_accepted();

        let peer = client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let peer_ip = client
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();

        // Pick the upstream. The selection guard, when balancing, is held
        // for the connection's lifetime so least_conn sees live counts.
        let selection = match &self.balancer {
            Some(balancer) => match balancer.next(&peer_ip) {
                Ok(selection) => Some(selection),
                Err(e) => {
                    self.stats.record_failed();
                    tunnelgrid_metrics::record_connection_failed(
                        tunnelgrid_metrics::REASON_NO_BACKEND,
                    );
                    tunnelgrid_metrics::record_connection_closed();
                    warn!(relay = %self.config.name, peer = %peer, error = %e, "no upstream");
                    return;
                }
            },
            None => None,
        };
        let target_addr = selection
            .as_ref()
            .map(|s| s.backend.addr())
            .unwrap_or_else(|| self.config.target());

        let target = match timeout(
            self.config.conn_timeout(),
            TcpStream::connect(&target_addr),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if let Some(selection) = &selection {
                    if let Some(balancer) = &self.balancer {
                        balancer.mark_healthy(selection.backend.host(), selection.backend.port());
                    }
                }
                stream
            }
            Ok(Err(e)) => {
                self.dial_failed(&target_addr, selection.as_ref(), Some(&e));
                return;
            }
            Err(_) => {
                self.dial_failed(&target_addr, selection.as_ref(), None);
                return;
            }
        };

        let _ = client.set_nodelay(true);
        let _ = target.set_nodelay(true);

        debug!(relay = %self.config.name, peer = %peer, "connection bridged");

        // Each wrapper shapes its own read side, so both directions are
        // capped independently at the configured rate.
        let client = Throttle::new(client, self.config.rate_limit_bps);
        let target = Throttle::new(target, self.config.rate_limit_bps);

        let metrics = ConnMetrics {
            stats: self.stats.clone(),
        };

        // Racing against the token drops both sockets on cancellation,
        // which unblocks any pending reads inside the relay future.
        tokio::select! {
            result = relay_bidirectional(
                client,
                target,
                CopyTuning::new(self.config.idle_timeout(), self.config.buffer_size()),
                &metrics,
            ) => {
                if let Err(e) = result {
                    debug!(relay = %self.config.name, peer = %peer, error = %e, "relay ended with error");
                }
            }
            _ = token.cancelled() => {
                debug!(relay = %self.config.name, peer = %peer, "connection cancelled by shutdown");
            }
        }

        tunnelgrid_metrics::record_connection_closed();
    }

    fn dial_failed(&self, target: &str, selection: Option<&Selection>, error: Option<&std::io::Error>) {
        self.stats.record_failed();
        tunnelgrid_metrics::record_connection_failed(tunnelgrid_metrics::REASON_DIAL);
        tunnelgrid_metrics::record_connection_closed();
        if let (Some(balancer), Some(selection)) = (&self.balancer, selection) {
            balancer.mark_failure(selection.backend.host(), selection.backend.port());
        }
        match error {
            Some(e) => {
                warn!(relay = %self.config.name, target, error = %e, "target dial failed");
            }
            None => warn!(relay = %self.config.name, target, "target dial timed out"),
        }
    }

    /// Cancel the accept loop and wait for in-flight connections to drain.
    pub async fn stop(&self) -> Result<(), RelayError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RelayError::NotRunning);
        }

        if let Some(token) = self.shutdown.write().take() {
            token.cancel();
        }

        let drained = self
            .tracker
            .wait_for_zero(Duration::from_secs(defaults::DEFAULT_DRAIN_TIMEOUT_SECS))
            .await;
        if !drained {
            error!(
                relay = %self.config.name,
                remaining = self.tracker.count(),
                "drain timeout expired with connections still open"
            );
        }

        self.running.store(false, Ordering::Release);
        info!(relay = %self.config.name, "tcp relay stopped");
        Ok(())
    }
}
