//! CLI entry point for the node binary.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunnelgrid_control::{NodeMessage, PlaneMessage};
use tunnelgrid_relay::{RelayConfig, RelayProtocol, TcpRelay, UdpRelay};
use tunnelgrid_tunnel::{BridgeConfig, TunnelRelayBridge};

use crate::config::NodeConfig;
use crate::engine::{RelayHandle, RuleEngine};
use crate::error::NodeError;
use crate::reporter;
use crate::uplink;

/// CLI arguments for the node binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tunnelgrid-node",
    version,
    about = "Relay node — applies pushed rules, relays traffic, reports stats"
)]
pub struct NodeArgs {
    /// Config file path (TOML).
    #[arg(short, long, default_value = "node.toml")]
    pub config: PathBuf,

    /// Log level override (e.g. "info", "debug", "trace").
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Run the node with the given CLI arguments.
pub async fn run(args: NodeArgs) -> anyhow::Result<()> {
    let config_str = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config file {:?}", args.config))?;
    let config: NodeConfig =
        toml::from_str(&config_str).context("failed to parse node config")?;
    config.validate().context("invalid node config")?;

    let log_level = args
        .log_level
        .as_deref()
        .or(config.log_level.as_deref())
        .unwrap_or("info");
    init_tracing(log_level);

    info!(
        version = tunnelgrid_core::VERSION,
        node_id = %config.node_id,
        "tunnelgrid node starting"
    );

    if let Some(listen) = &config.metrics_listen {
        tunnelgrid_metrics::init_prometheus(listen)
            .map_err(|e| anyhow::anyhow!(e))
            .context("failed to start metrics exporter")?;
        info!(listen = %listen, "prometheus exporter started");
    }

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    // Events outlive uplink sessions: failover monitors keep queueing here
    // while the node is disconnected.
    let (events_tx, events_rx) = mpsc::channel::<NodeMessage>(64);
    let engine = Arc::new(RuleEngine::new(
        config.node_id.clone(),
        config.tunnel.clone(),
        events_tx,
    ));

    let static_relays = start_static_relays(&config).await?;

    if config.control_url.is_empty() {
        info!("no control plane configured, running static relays only");
        shutdown.cancelled().await;
    } else {
        node_loop(&config, engine.clone(), events_rx, shutdown.clone()).await;
    }

    info!("draining relays");
    engine.stop_all().await;
    for relay in &static_relays {
        relay.stop().await;
    }
    info!("node stopped");
    Ok(())
}

/// Boot the `[[relays]]` entries from the local config.
async fn start_static_relays(config: &NodeConfig) -> Result<Vec<RelayHandle>, NodeError> {
    let mut handles = Vec::with_capacity(config.relays.len());
    for relay_config in &config.relays {
        let handle = start_static_relay(config, relay_config.clone()).await?;
        info!(
            relay = %relay_config.name,
            listen = %relay_config.listen(),
            target = %relay_config.target(),
            "static relay started"
        );
        handles.push(handle);
    }
    Ok(handles)
}

async fn start_static_relay(
    config: &NodeConfig,
    relay_config: RelayConfig,
) -> Result<RelayHandle, NodeError> {
    if relay_config.enable_encrypt {
        let template = config.tunnel.as_ref().ok_or_else(|| {
            NodeError::Config(format!(
                "relay {}: encryption enabled but node has no [tunnel] template",
                relay_config.name
            ))
        })?;
        let bridge_config = BridgeConfig {
            name: relay_config.name.clone(),
            listen_addr: relay_config.listen_addr,
            listen_port: relay_config.listen_port,
            tunnel: template.to_tunnel_config(&relay_config.target_addr, relay_config.target_port),
            idle_timeout_secs: relay_config.idle_timeout_secs,
            buffer_size: relay_config.buffer_size,
        };
        let bridge = Arc::new(TunnelRelayBridge::new(bridge_config));
        bridge.start().await?;
        return Ok(RelayHandle::Bridge(bridge));
    }

    match relay_config.protocol {
        RelayProtocol::Tcp => {
            let relay = Arc::new(TcpRelay::new(relay_config));
            relay.start().await?;
            Ok(RelayHandle::Tcp(relay))
        }
        RelayProtocol::Udp => {
            let relay = Arc::new(UdpRelay::new(relay_config));
            relay.start().await?;
            Ok(RelayHandle::Udp(relay))
        }
    }
}

/// Outer reconnect loop with exponential backoff.
///
/// Relays keep running across disconnections; only the uplink session and
/// its reporter restart.
async fn node_loop(
    config: &NodeConfig,
    engine: Arc<RuleEngine>,
    mut events_rx: mpsc::Receiver<NodeMessage>,
    shutdown: CancellationToken,
) {
    let mut delay_ms = config.reconnect.initial_delay_ms;

    loop {
        match run_session(config, &engine, &mut events_rx, shutdown.clone()).await {
            Ok(()) => {
                info!("session ended cleanly");
                if shutdown.is_cancelled() {
                    return;
                }
                delay_ms = config.reconnect.initial_delay_ms;
            }
            Err(e) => {
                if shutdown.is_cancelled() {
                    return;
                }
                warn!(error = %e, "session failed");
            }
        }

        if shutdown.is_cancelled() {
            return;
        }

        // Jitter: delay * (1 ± jitter)
        let jitter_factor =
            1.0 + config.reconnect.jitter * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        let actual_delay = (delay_ms as f64 * jitter_factor) as u64;
        info!(delay_ms = actual_delay, "reconnecting after delay");

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(actual_delay)) => {}
        }

        let next = (delay_ms as f64 * config.reconnect.multiplier) as u64;
        delay_ms = next.min(config.reconnect.max_delay_ms);
    }
}

/// One control-plane session: connect, then pump frames until it drops.
async fn run_session(
    config: &NodeConfig,
    engine: &Arc<RuleEngine>,
    events_rx: &mut mpsc::Receiver<NodeMessage>,
    shutdown: CancellationToken,
) -> Result<(), NodeError> {
    let mut uplink = uplink::connect(config, shutdown.clone()).await?;

    let reporter_shutdown = CancellationToken::new();
    let reporter_handle = tokio::spawn(reporter::run_reporter(
        uplink.tx.clone(),
        engine.clone(),
        config.node_id.clone(),
        config.report_interval(),
        reporter_shutdown.clone(),
    ));

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("shutdown requested, closing session");
                break Ok(());
            }

            event = events_rx.recv() => {
                // The engine holds a sender, so this channel never yields None
                // while the engine is alive.
                if let Some(event) = event {
                    if uplink.tx.send(event).await.is_err() {
                        break Err(NodeError::ConnectionClosed);
                    }
                }
            }

            frame = uplink.rx.recv() => {
                match frame {
                    Some(PlaneMessage::SyncRules { rules, force, version }) => {
                        info!(rules = rules.len(), force, version, "rule sync received");
                        engine.apply_sync_rules(rules, force).await;
                    }
                    Some(PlaneMessage::DeleteRule { tunnel_id }) => {
                        engine.delete_rule(&tunnel_id).await;
                    }
                    None => {
                        warn!("control connection lost");
                        break Err(NodeError::ConnectionClosed);
                    }
                }
            }
        }
    };

    reporter_shutdown.cancel();
    let _ = reporter_handle.await;
    result
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}
