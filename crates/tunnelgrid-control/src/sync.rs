//! Rule distribution to connected nodes.
//!
//! The sync service turns authored tunnel rules into wire payloads and
//! pushes them to nodes over whatever transport the caller provides via
//! [`RuleSender`]. Delivery is best-effort: a node without a live
//! connection is skipped silently, and the full resync it performs on
//! reconnect is the only recovery path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use tunnelgrid_lb::LbStrategy;

use crate::error::ControlError;
use crate::protocol::{PlaneMessage, RuleTarget, SyncRulePayload};

/// Authored relay rule, before version stamping and key resolution.
#[derive(Debug, Clone)]
pub struct TunnelRule {
    pub tunnel_id: String,
    /// "tcp" or "udp".
    pub protocol: String,
    pub listen_port: u16,
    /// Explicit balancing targets; empty means "use the primary address".
    pub targets: Vec<RuleTarget>,
    pub lb_strategy: LbStrategy,
    pub primary_host: String,
    pub primary_port: u16,
    pub enable_encryption: bool,
    pub rate_limit_bps: u64,
    pub max_connections: u64,
    pub idle_timeout: u64,
    /// Node group this rule is deployed to.
    pub node_group_id: String,
    pub failover_group_id: Option<String>,
    pub failover_timeout: u64,
    pub failover_auto_recover: bool,
}

/// Fetches the active key for a tunnel. Key issuance lives elsewhere; the
/// sync path only ever reads.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn active_key(&self, tunnel_id: &str) -> Result<Option<String>, ControlError>;
}

/// Node-group membership and liveness directory.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Node ids belonging to a group.
    async fn node_ids(&self, group_id: &str) -> Vec<String>;
    /// Public IPs of the group's currently online nodes.
    async fn online_public_ips(&self, group_id: &str) -> Vec<String>;
}

/// Monotonic per-tunnel version counter.
pub trait RuleVersions: Send + Sync {
    /// Allocate the next version for a tunnel. Strictly increasing per id.
    fn next(&self, tunnel_id: &str) -> u64;
    fn current(&self, tunnel_id: &str) -> u64;
}

/// In-memory version counter.
#[derive(Default)]
pub struct MemoryRuleVersions {
    versions: Mutex<HashMap<String, u64>>,
}

impl MemoryRuleVersions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleVersions for MemoryRuleVersions {
    fn next(&self, tunnel_id: &str) -> u64 {
        let mut versions = self.versions.lock();
        let v = versions.entry(tunnel_id.to_string()).or_insert(0);
        *v += 1;
        *v
    }

    fn current(&self, tunnel_id: &str) -> u64 {
        self.versions.lock().get(tunnel_id).copied().unwrap_or(0)
    }
}

/// Transport-agnostic frame delivery to a node.
#[async_trait]
pub trait RuleSender: Send + Sync {
    async fn is_connected(&self, node_id: &str) -> bool;
    async fn send(&self, node_id: &str, frame: &PlaneMessage) -> Result<(), ControlError>;
}

/// Builds payloads from rules and delivers them to nodes.
pub struct RuleSyncService<S> {
    sender: S,
    keys: Arc<dyn KeyProvider>,
    directory: Arc<dyn GroupDirectory>,
    versions: Arc<dyn RuleVersions>,
}

impl<S: RuleSender> RuleSyncService<S> {
    pub fn new(
        sender: S,
        keys: Arc<dyn KeyProvider>,
        directory: Arc<dyn GroupDirectory>,
        versions: Arc<dyn RuleVersions>,
    ) -> Self {
        Self {
            sender,
            keys,
            directory,
            versions,
        }
    }

    /// Flatten an authored rule into a wire payload: resolve targets, key
    /// material, failover candidates, and stamp the next version.
    pub async fn build_rule_payload(
        &self,
        rule: &TunnelRule,
    ) -> Result<SyncRulePayload, ControlError> {
        let targets = if rule.targets.is_empty() {
            vec![RuleTarget {
                host: rule.primary_host.clone(),
                port: rule.primary_port,
                weight: 1,
            }]
        } else {
            rule.targets.clone()
        };

        // Key material rides along only when the tunnel actually encrypts.
        let encryption_key = if rule.enable_encryption {
            self.keys.active_key(&rule.tunnel_id).await?
        } else {
            None
        };

        let failover_targets = match &rule.failover_group_id {
            Some(group_id) => self
                .directory
                .online_public_ips(group_id)
                .await
                .into_iter()
                .map(|host| RuleTarget {
                    host,
                    port: rule.listen_port,
                    weight: 1,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(SyncRulePayload {
            tunnel_id: rule.tunnel_id.clone(),
            protocol: rule.protocol.clone(),
            listen_port: rule.listen_port,
            targets,
            lb_strategy: rule.lb_strategy,
            enable_encryption: rule.enable_encryption,
            encryption_key,
            rate_limit_bps: rule.rate_limit_bps,
            max_connections: rule.max_connections,
            idle_timeout: rule.idle_timeout,
            version: self.versions.next(&rule.tunnel_id),
            failover_targets,
            failover_timeout: rule.failover_timeout,
            failover_auto_recover: rule.failover_auto_recover,
            failover_group_id: rule.failover_group_id.clone(),
        })
    }

    /// Push payloads to one node. Returns whether anything was sent; a
    /// disconnected node is skipped without error.
    pub async fn send_to_node(
        &self,
        node_id: &str,
        rules: Vec<SyncRulePayload>,
        force: bool,
    ) -> Result<bool, ControlError> {
        if rules.is_empty() {
            return Ok(false);
        }
        if !self.sender.is_connected(node_id).await {
            debug!(node_id, "node offline, skipping rule push");
            tunnelgrid_metrics::record_rule_push_skipped();
            return Ok(false);
        }

        let count = rules.len();
        let version = rules.iter().map(|r| r.version).max().unwrap_or(0);
        let frame = PlaneMessage::SyncRules {
            rules,
            force,
            version,
        };
        self.sender.send(node_id, &frame).await?;
        tunnelgrid_metrics::record_rule_push("sync_rules");
        info!(node_id, count, version, force, "rules pushed");
        Ok(true)
    }

    /// Push a rule set to every member of a node group that is online.
    pub async fn send_to_group(
        &self,
        group_id: &str,
        rules: Vec<SyncRulePayload>,
        force: bool,
    ) -> Result<usize, ControlError> {
        let mut delivered = 0;
        for node_id in self.directory.node_ids(group_id).await {
            if self.send_to_node(&node_id, rules.clone(), force).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Full forced resync of a node's rule set, used when a node reconnects.
    pub async fn sync_all_rules_to_node(
        &self,
        node_id: &str,
        rules: &[TunnelRule],
    ) -> Result<bool, ControlError> {
        let mut payloads = Vec::with_capacity(rules.len());
        for rule in rules {
            payloads.push(self.build_rule_payload(rule).await?);
        }
        self.send_to_node(node_id, payloads, true).await
    }

    /// Push a rule deletion to all online members of a group.
    pub async fn send_delete_rule(
        &self,
        group_id: &str,
        tunnel_id: &str,
    ) -> Result<usize, ControlError> {
        let frame = PlaneMessage::DeleteRule {
            tunnel_id: tunnel_id.to_string(),
        };
        let mut delivered = 0;
        for node_id in self.directory.node_ids(group_id).await {
            if !self.sender.is_connected(&node_id).await {
                debug!(node_id, "node offline, skipping rule delete");
                tunnelgrid_metrics::record_rule_push_skipped();
                continue;
            }
            self.sender.send(&node_id, &frame).await?;
            tunnelgrid_metrics::record_rule_push("delete_rule");
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct StaticKeys;

    #[async_trait]
    impl KeyProvider for StaticKeys {
        async fn active_key(&self, tunnel_id: &str) -> Result<Option<String>, ControlError> {
            Ok(Some(format!("key-for-{}", tunnel_id)))
        }
    }

    struct StaticDirectory {
        members: Vec<String>,
        online_ips: Vec<String>,
    }

    #[async_trait]
    impl GroupDirectory for StaticDirectory {
        async fn node_ids(&self, _group_id: &str) -> Vec<String> {
            self.members.clone()
        }
        async fn online_public_ips(&self, _group_id: &str) -> Vec<String> {
            self.online_ips.clone()
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        connected: HashSet<String>,
        sent: Mutex<Vec<(String, PlaneMessage)>>,
    }

    #[async_trait]
    impl RuleSender for RecordingSender {
        async fn is_connected(&self, node_id: &str) -> bool {
            self.connected.contains(node_id)
        }
        async fn send(&self, node_id: &str, frame: &PlaneMessage) -> Result<(), ControlError> {
            self.sent.lock().push((node_id.to_string(), frame.clone()));
            Ok(())
        }
    }

    fn rule(tunnel_id: &str, encrypted: bool) -> TunnelRule {
        TunnelRule {
            tunnel_id: tunnel_id.into(),
            protocol: "tcp".into(),
            listen_port: 8443,
            targets: vec![],
            lb_strategy: LbStrategy::RoundRobin,
            primary_host: "10.0.0.5".into(),
            primary_port: 443,
            enable_encryption: encrypted,
            rate_limit_bps: 0,
            max_connections: 0,
            idle_timeout: 0,
            node_group_id: "g-edge".into(),
            failover_group_id: Some("g-backup".into()),
            failover_timeout: 30,
            failover_auto_recover: true,
        }
    }

    fn service(sender: RecordingSender, online_ips: Vec<String>) -> RuleSyncService<RecordingSender> {
        RuleSyncService::new(
            sender,
            Arc::new(StaticKeys),
            Arc::new(StaticDirectory {
                members: vec!["node-a".into(), "node-b".into()],
                online_ips,
            }),
            Arc::new(MemoryRuleVersions::new()),
        )
    }

    #[tokio::test]
    async fn payload_synthesizes_primary_target_and_resolves_failover() {
        let svc = service(RecordingSender::default(), vec!["203.0.113.7".into()]);
        let payload = svc.build_rule_payload(&rule("tun-1", false)).await.unwrap();

        assert_eq!(payload.targets.len(), 1);
        assert_eq!(payload.targets[0].host, "10.0.0.5");
        assert_eq!(payload.targets[0].port, 443);
        assert_eq!(payload.encryption_key, None);
        assert_eq!(payload.failover_targets.len(), 1);
        assert_eq!(payload.failover_targets[0].host, "203.0.113.7");
        assert_eq!(payload.failover_targets[0].port, 8443);
        assert_eq!(payload.version, 1);
    }

    #[tokio::test]
    async fn key_attached_only_when_encrypted() {
        let svc = service(RecordingSender::default(), vec![]);
        let plain = svc.build_rule_payload(&rule("tun-1", false)).await.unwrap();
        assert!(plain.encryption_key.is_none());

        let encrypted = svc.build_rule_payload(&rule("tun-1", true)).await.unwrap();
        assert_eq!(encrypted.encryption_key.as_deref(), Some("key-for-tun-1"));
    }

    #[tokio::test]
    async fn versions_increase_per_tunnel() {
        let svc = service(RecordingSender::default(), vec![]);
        let first = svc.build_rule_payload(&rule("tun-1", false)).await.unwrap();
        let second = svc.build_rule_payload(&rule("tun-1", false)).await.unwrap();
        let other = svc.build_rule_payload(&rule("tun-2", false)).await.unwrap();
        assert!(second.version > first.version);
        assert_eq!(other.version, 1);
    }

    #[tokio::test]
    async fn offline_nodes_are_skipped_silently() {
        let mut sender = RecordingSender::default();
        sender.connected.insert("node-a".into());
        let svc = service(sender, vec![]);

        let payload = svc.build_rule_payload(&rule("tun-1", false)).await.unwrap();
        let delivered = svc
            .send_to_group("g-edge", vec![payload], false)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        let sent = svc.sender.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "node-a");
    }

    #[tokio::test]
    async fn reconnect_resync_is_forced() {
        let mut sender = RecordingSender::default();
        sender.connected.insert("node-a".into());
        let svc = service(sender, vec![]);

        let rules = vec![rule("tun-1", false), rule("tun-2", false)];
        assert!(svc.sync_all_rules_to_node("node-a", &rules).await.unwrap());

        let sent = svc.sender.sent.lock();
        match &sent[0].1 {
            PlaneMessage::SyncRules { rules, force, .. } => {
                assert!(force);
                assert_eq!(rules.len(), 2);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_reaches_only_online_members() {
        let mut sender = RecordingSender::default();
        sender.connected.insert("node-b".into());
        let svc = service(sender, vec![]);

        let delivered = svc.send_delete_rule("g-edge", "tun-1").await.unwrap();
        assert_eq!(delivered, 1);
        let sent = svc.sender.sent.lock();
        assert_eq!(sent[0].0, "node-b");
        assert!(matches!(sent[0].1, PlaneMessage::DeleteRule { .. }));
    }
}
