//! Rule engine — owns the relays this node is running.
//!
//! Rules arrive as versioned payloads over the uplink. Each applied rule
//! becomes one running relay (plain TCP, UDP, or a tunnel bridge when the
//! rule enables encryption) plus its balancer and, when failover targets
//! exist, a failover monitor task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelgrid_core::stats::RelayStats;
use tunnelgrid_control::{NodeMessage, RelayStatsReport, SyncRulePayload};
use tunnelgrid_lb::LoadBalancer;
use tunnelgrid_relay::{RelayConfig, RelayProtocol, TcpRelay, UdpRelay};
use tunnelgrid_tunnel::{BridgeConfig, TunnelRelayBridge};

use crate::config::TunnelTemplate;
use crate::error::NodeError;
use crate::failover::FailoverMonitor;

/// A running relay of any flavor.
pub enum RelayHandle {
    Tcp(Arc<TcpRelay>),
    Udp(Arc<UdpRelay>),
    Bridge(Arc<TunnelRelayBridge>),
}

impl RelayHandle {
    pub fn stats(&self) -> Arc<RelayStats> {
        match self {
            RelayHandle::Tcp(relay) => relay.stats().clone(),
            RelayHandle::Udp(relay) => relay.stats().clone(),
            RelayHandle::Bridge(bridge) => bridge.stats().clone(),
        }
    }

    pub async fn stop(&self) {
        let result = match self {
            RelayHandle::Tcp(relay) => relay.stop().await.map_err(NodeError::from),
            RelayHandle::Udp(relay) => relay.stop().await.map_err(NodeError::from),
            RelayHandle::Bridge(bridge) => bridge.stop().await.map_err(NodeError::from),
        };
        if let Err(e) = result {
            debug!(error = %e, "relay stop reported an error");
        }
    }
}

struct RunningTunnel {
    version: u64,
    relay: RelayHandle,
    monitor: Option<(CancellationToken, JoinHandle<()>)>,
}

impl RunningTunnel {
    async fn teardown(self) {
        if let Some((token, handle)) = self.monitor {
            token.cancel();
            let _ = handle.await;
        }
        self.relay.stop().await;
    }
}

pub struct RuleEngine {
    node_id: String,
    template: Option<TunnelTemplate>,
    events: mpsc::Sender<NodeMessage>,
    tunnels: Mutex<HashMap<String, RunningTunnel>>,
}

impl RuleEngine {
    pub fn new(
        node_id: String,
        template: Option<TunnelTemplate>,
        events: mpsc::Sender<NodeMessage>,
    ) -> Self {
        Self {
            node_id,
            template,
            events,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a batch of pushed rules. Stale or already-applied versions are
    /// no-ops unless `force` is set; changed rules replace their running
    /// relay. Returns how many rules were (re)applied.
    pub async fn apply_sync_rules(&self, rules: Vec<SyncRulePayload>, force: bool) -> usize {
        let mut applied = 0;
        for rule in rules {
            let mut tunnels = self.tunnels.lock().await;
            if let Some(existing) = tunnels.get(&rule.tunnel_id) {
                if rule.version <= existing.version && !force {
                    debug!(
                        tunnel = %rule.tunnel_id,
                        pushed = rule.version,
                        applied = existing.version,
                        "skipping stale rule version"
                    );
                    continue;
                }
            }

            if let Some(existing) = tunnels.remove(&rule.tunnel_id) {
                info!(tunnel = %rule.tunnel_id, "replacing running relay");
                existing.teardown().await;
            }

            match self.launch(&rule).await {
                Ok(running) => {
                    info!(
                        tunnel = %rule.tunnel_id,
                        version = rule.version,
                        listen_port = rule.listen_port,
                        targets = rule.targets.len(),
                        "rule applied"
                    );
                    tunnels.insert(rule.tunnel_id.clone(), running);
                    applied += 1;
                }
                Err(e) => {
                    warn!(tunnel = %rule.tunnel_id, error = %e, "failed to apply rule");
                }
            }
        }
        applied
    }

    /// Stop and remove one tunnel. Idempotent.
    pub async fn delete_rule(&self, tunnel_id: &str) {
        let removed = self.tunnels.lock().await.remove(tunnel_id);
        match removed {
            Some(running) => {
                info!(tunnel = %tunnel_id, "rule deleted, relay stopped");
                running.teardown().await;
            }
            None => debug!(tunnel = %tunnel_id, "delete for unknown tunnel"),
        }
    }

    /// Stop every running relay, for node shutdown.
    pub async fn stop_all(&self) {
        let mut tunnels = self.tunnels.lock().await;
        for (tunnel_id, running) in tunnels.drain() {
            debug!(tunnel = %tunnel_id, "stopping relay");
            running.teardown().await;
        }
    }

    /// Per-tunnel counters for the stats reporter.
    pub async fn snapshots(&self) -> Vec<RelayStatsReport> {
        let tunnels = self.tunnels.lock().await;
        tunnels
            .iter()
            .map(|(tunnel_id, running)| RelayStatsReport {
                tunnel_id: tunnel_id.clone(),
                counters: running.relay.stats().snapshot(),
            })
            .collect()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn applied_version(&self, tunnel_id: &str) -> Option<u64> {
        self.tunnels
            .lock()
            .await
            .get(tunnel_id)
            .map(|running| running.version)
    }

    async fn launch(&self, rule: &SyncRulePayload) -> Result<RunningTunnel, NodeError> {
        let primary = rule
            .targets
            .first()
            .ok_or_else(|| NodeError::Config(format!("rule {}: no targets", rule.tunnel_id)))?;

        let balancer = Arc::new(LoadBalancer::new(rule.lb_strategy));
        for target in &rule.targets {
            balancer.add_backend(target.host.clone(), target.port, target.weight);
        }

        let protocol = match rule.protocol.as_str() {
            "udp" => RelayProtocol::Udp,
            "tcp" => RelayProtocol::Tcp,
            other => {
                return Err(NodeError::Config(format!(
                    "rule {}: unknown protocol {other:?}",
                    rule.tunnel_id
                )));
            }
        };

        let relay = if rule.enable_encryption && protocol == RelayProtocol::Tcp {
            let template = self.template.as_ref().ok_or_else(|| {
                NodeError::Config(format!(
                    "rule {}: encryption enabled but node has no [tunnel] template",
                    rule.tunnel_id
                ))
            })?;
            let bridge_config = BridgeConfig {
                name: rule.tunnel_id.clone(),
                listen_addr: IpAddr::from([0, 0, 0, 0]),
                listen_port: rule.listen_port,
                tunnel: template.to_tunnel_config(&primary.host, primary.port),
                idle_timeout_secs: rule.idle_timeout,
                buffer_size: 0,
            };
            let bridge = Arc::new(TunnelRelayBridge::with_balancer(bridge_config, balancer.clone()));
            bridge.start().await?;
            RelayHandle::Bridge(bridge)
        } else {
            if rule.enable_encryption {
                // Datagram traffic cannot ride the stream tunnel.
                warn!(tunnel = %rule.tunnel_id, "encryption requested for udp rule, relaying plain");
            }
            let relay_config = RelayConfig {
                name: rule.tunnel_id.clone(),
                listen_addr: IpAddr::from([0, 0, 0, 0]),
                listen_port: rule.listen_port,
                target_addr: primary.host.clone(),
                target_port: primary.port,
                protocol,
                buffer_size: 0,
                max_connections: rule.max_connections,
                idle_timeout_secs: rule.idle_timeout,
                conn_timeout_secs: tunnelgrid_core::defaults::DEFAULT_CONNECT_TIMEOUT_SECS,
                rate_limit_bps: rule.rate_limit_bps,
                enable_encrypt: false,
                encrypt_method: None,
            };
            match protocol {
                RelayProtocol::Tcp => {
                    let relay = Arc::new(TcpRelay::with_balancer(relay_config, balancer.clone()));
                    relay.start().await?;
                    RelayHandle::Tcp(relay)
                }
                RelayProtocol::Udp => {
                    let relay = Arc::new(UdpRelay::with_balancer(relay_config, balancer.clone()));
                    relay.start().await?;
                    RelayHandle::Udp(relay)
                }
            }
        };

        let monitor = if rule.failover_targets.is_empty() {
            None
        } else {
            let token = CancellationToken::new();
            let monitor = FailoverMonitor::new(
                self.node_id.clone(),
                rule.tunnel_id.clone(),
                balancer,
                rule.targets.clone(),
                rule.failover_targets.clone(),
                rule.failover_timeout,
                rule.failover_auto_recover,
                rule.failover_group_id.clone(),
                self.events.clone(),
            );
            let handle = tokio::spawn(monitor.run(token.clone()));
            Some((token, handle))
        };

        Ok(RunningTunnel {
            version: rule.version,
            relay,
            monitor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tunnelgrid_control::RuleTarget;
    use tunnelgrid_lb::LbStrategy;

    fn engine() -> (RuleEngine, mpsc::Receiver<NodeMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (RuleEngine::new("node-test".into(), None, tx), rx)
    }

    fn rule(tunnel_id: &str, version: u64) -> SyncRulePayload {
        SyncRulePayload {
            tunnel_id: tunnel_id.into(),
            protocol: "tcp".into(),
            listen_port: 0,
            targets: vec![RuleTarget {
                host: "127.0.0.1".into(),
                port: 1,
                weight: 1,
            }],
            lb_strategy: LbStrategy::RoundRobin,
            enable_encryption: false,
            encryption_key: None,
            rate_limit_bps: 0,
            max_connections: 0,
            idle_timeout: 0,
            version,
            failover_targets: vec![],
            failover_timeout: 0,
            failover_auto_recover: false,
            failover_group_id: None,
        }
    }

    #[tokio::test]
    async fn stale_versions_are_skipped_unless_forced() {
        let (engine, _rx) = engine();

        assert_eq!(engine.apply_sync_rules(vec![rule("tun-1", 5)], false).await, 1);
        assert_eq!(engine.applied_version("tun-1").await, Some(5));

        // Equal and older versions are no-ops.
        assert_eq!(engine.apply_sync_rules(vec![rule("tun-1", 5)], false).await, 0);
        assert_eq!(engine.apply_sync_rules(vec![rule("tun-1", 3)], false).await, 0);
        assert_eq!(engine.applied_version("tun-1").await, Some(5));

        // Forced resync reapplies whatever the plane says is current.
        assert_eq!(engine.apply_sync_rules(vec![rule("tun-1", 3)], true).await, 1);
        assert_eq!(engine.applied_version("tun-1").await, Some(3));

        engine.stop_all().await;
    }

    #[tokio::test]
    async fn delete_rule_is_idempotent() {
        let (engine, _rx) = engine();

        engine.apply_sync_rules(vec![rule("tun-1", 1)], false).await;
        assert_eq!(engine.tunnel_count().await, 1);

        engine.delete_rule("tun-1").await;
        assert_eq!(engine.tunnel_count().await, 0);
        engine.delete_rule("tun-1").await;
        assert_eq!(engine.tunnel_count().await, 0);
    }

    #[tokio::test]
    async fn rule_without_targets_is_rejected() {
        let (engine, _rx) = engine();
        let mut bad = rule("tun-bad", 1);
        bad.targets.clear();
        assert_eq!(engine.apply_sync_rules(vec![bad], false).await, 0);
        assert_eq!(engine.tunnel_count().await, 0);
    }

    #[tokio::test]
    async fn encrypted_rule_requires_template() {
        let (engine, _rx) = engine();
        let mut encrypted = rule("tun-enc", 1);
        encrypted.enable_encryption = true;
        assert_eq!(engine.apply_sync_rules(vec![encrypted], false).await, 0);
    }

    #[tokio::test]
    async fn snapshots_name_running_tunnels() {
        let (engine, _rx) = engine();
        engine
            .apply_sync_rules(vec![rule("tun-a", 1), rule("tun-b", 1)], false)
            .await;

        let mut names: Vec<String> = engine
            .snapshots()
            .await
            .into_iter()
            .map(|report| report.tunnel_id)
            .collect();
        names.sort();
        assert_eq!(names, vec!["tun-a", "tun-b"]);

        engine.stop_all().await;
    }
}
