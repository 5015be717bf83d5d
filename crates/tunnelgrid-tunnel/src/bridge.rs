//! Local listener that forwards each accepted connection through a tunnel.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelgrid_core::defaults;
use tunnelgrid_core::io::{relay_bidirectional, CopyTuning, NoOpMetrics, RelayMetrics};
use tunnelgrid_core::stats::RelayStats;
use tunnelgrid_core::tracker::ConnectionTracker;
use tunnelgrid_lb::LoadBalancer;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::stream::{connect, TunnelStream};

/// Configuration for a tunnel relay bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub name: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    pub listen_port: u16,

    pub tunnel: TunnelConfig,

    /// Zero selects the TCP default (5 min).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Zero selects the TCP default (32 KiB).
    #[serde(default)]
    pub buffer_size: usize,
}

impl BridgeConfig {
    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn idle_timeout(&self) -> Duration {
        let secs = if self.idle_timeout_secs > 0 {
            self.idle_timeout_secs
        } else {
            defaults::DEFAULT_TCP_IDLE_TIMEOUT_SECS
        };
        Duration::from_secs(secs)
    }

    pub fn buffer_size(&self) -> usize {
        if self.buffer_size > 0 {
            self.buffer_size
        } else {
            defaults::DEFAULT_TCP_BUFFER_SIZE
        }
    }
}

fn default_listen_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

/// Bridge a freshly dialed tunnel with a local connection.
///
/// Same copy contract as the TCP relay: both directions run until EOF on
/// each, an error, or the idle window elapses.
pub async fn bridge_to_conn<L>(
    tunnel: TunnelStream,
    local: L,
    idle_timeout: Duration,
    buffer_size: usize,
) -> std::io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    relay_bidirectional(
        local,
        tunnel,
        CopyTuning::new(idle_timeout, buffer_size),
        &NoOpMetrics,
    )
    .await
}

struct BridgeMetrics {
    stats: Arc<RelayStats>,
}

impl RelayMetrics for BridgeMetrics {
    fn record_forward(&self, bytes: u64) {
        self.stats.add_bytes_in(bytes);
        tunnelgrid_metrics::record_bytes_in(bytes);
    }
    fn record_reverse(&self, bytes: u64) {
        self.stats.add_bytes_out(bytes);
        tunnelgrid_metrics::record_bytes_out(bytes);
    }
}

/// Local TCP listener whose accepted connections each ride a dedicated
/// tunnel to the remote. One tunnel per client connection; nothing is
/// multiplexed, so a broken tunnel only takes down its own client.
pub struct TunnelRelayBridge {
    config: BridgeConfig,
    /// When present, the tunnel remote is chosen per connection.
    balancer: Option<Arc<LoadBalancer>>,
    stats: Arc<RelayStats>,
    tracker: ConnectionTracker,
    running: AtomicBool,
    shutdown: RwLock<Option<CancellationToken>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl TunnelRelayBridge {
    pub fn new(config: BridgeConfig) -> Self {
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

    /// Bridge whose tunnel remote is selected per connection by `balancer`.
    pub fn with_balancer(config: BridgeConfig, balancer: Arc<LoadBalancer>) -> Self {
        let mut bridge = Self::new(config);
        bridge.balancer = Some(balancer);
        bridge
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TunnelError::AlreadyRunning);
        }
        if let Err(e) = self.config.tunnel.validate() {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

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
            bridge = %self.config.name,
            listen = %self.config.listen(),
            remote = %self.config.tunnel.remote(),
            kind = ?self.config.tunnel.kind,
            "tunnel bridge started"
        );

        let bridge = self.clone();
        tokio::spawn(async move {
            bridge.accept_loop(listener, token).await;
        });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    let (local, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(bridge = %self.config.name, error = %e, "accept failed");
                            continue;
                        }
                    };
                    let bridge = self.clone();
                    let conn_token = token.clone();
                    tokio::spawn(async move {
                        bridge.handle_connection(local, peer, conn_token).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        local: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) {
        let _slot = self.tracker.track();
        let _active = self.stats.connection_started();
        tunnelgrid_metrics::record_connection_accepted();

        // Pick the remote, then dial a fresh tunnel for this connection.
        let selection = match &self.balancer {
            Some(balancer) => match balancer.next(&peer.ip().to_string()) {
                Ok(selection) => Some(selection),
                Err(e) => {
                    self.stats.record_failed();
                    tunnelgrid_metrics::record_connection_failed(
                        tunnelgrid_metrics::REASON_NO_BACKEND,
                    );
                    tunnelgrid_metrics::record_connection_closed();
                    warn!(bridge = %self.config.name, peer = %peer, error = %e, "no tunnel remote");
                    return;
                }
            },
            None => None,
        };
        let tunnel_config = match &selection {
            Some(selection) => {
                let mut config = self.config.tunnel.clone();
                config.remote_addr = selection.backend.host().to_string();
                config.remote_port = selection.backend.port();
                config
            }
            None => self.config.tunnel.clone(),
        };

        let tunnel = match connect(&tunnel_config).await {
            Ok(tunnel) => {
                if let (Some(balancer), Some(selection)) = (&self.balancer, &selection) {
                    balancer.mark_healthy(selection.backend.host(), selection.backend.port());
                }
                tunnel
            }
            Err(e) => {
                self.stats.record_failed();
                tunnelgrid_metrics::record_connection_failed(tunnelgrid_metrics::REASON_DIAL);
                tunnelgrid_metrics::record_connection_closed();
                if let (Some(balancer), Some(selection)) = (&self.balancer, &selection) {
                    balancer.mark_failure(selection.backend.host(), selection.backend.port());
                }
                warn!(
                    bridge = %self.config.name,
                    remote = %tunnel_config.remote(),
                    error = %e,
                    "tunnel dial failed"
                );
                return;
            }
        };

        let _ = local.set_nodelay(true);
        debug!(bridge = %self.config.name, peer = %peer, "connection tunneled");

        let metrics = BridgeMetrics {
            stats: self.stats.clone(),
        };

        tokio::select! {
            result = relay_bidirectional(
                local,
                tunnel,
                CopyTuning::new(self.config.idle_timeout(), self.config.buffer_size()),
                &metrics,
            ) => {
                if let Err(e) = result {
                    debug!(bridge = %self.config.name, peer = %peer, error = %e, "bridge ended with error");
                }
            }
            _ = token.cancelled() => {
                debug!(bridge = %self.config.name, peer = %peer, "connection cancelled by shutdown");
            }
        }

        tunnelgrid_metrics::record_connection_closed();
    }

    pub async fn stop(&self) -> Result<(), TunnelError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TunnelError::NotRunning);
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
                bridge = %self.config.name,
                remaining = self.tracker.count(),
                "drain timeout expired with connections still open"
            );
        }

        self.running.store(false, Ordering::Release);
        info!(bridge = %self.config.name, "tunnel bridge stopped");
        Ok(())
    }
}
