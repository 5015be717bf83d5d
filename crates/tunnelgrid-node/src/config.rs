//! Node local configuration.
//!
//! The TOML file only needs identity and the control-plane endpoint; relay
//! rules arrive over the uplink. Static `[[relays]]` entries exist for
//! standalone deployments that run without a control plane.

use serde::Deserialize;

use tunnelgrid_core::defaults;
use tunnelgrid_relay::RelayConfig;
use tunnelgrid_tunnel::{TunnelConfig, TunnelKind};

use crate::error::NodeError;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Stable node identity, as known to the control plane.
    pub node_id: String,

    /// Control-plane WebSocket URL (e.g. `wss://control.example.com/ws/node`).
    pub control_url: String,

    /// Node authentication token issued by the control plane.
    pub token: String,

    /// Log level override (trace, debug, info, warn, error).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Prometheus exporter listen address; unset disables the exporter.
    #[serde(default)]
    pub metrics_listen: Option<String>,

    /// Override stats report interval in seconds.
    #[serde(default)]
    pub report_interval_secs: Option<u64>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Tunnel transport template applied to encrypted rules. Rules that
    /// enable encryption are rejected when this is absent.
    #[serde(default)]
    pub tunnel: Option<TunnelTemplate>,

    /// Relays started at boot, independent of the control plane.
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
}

impl NodeConfig {
    pub fn report_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.report_interval_secs
                .unwrap_or(defaults::DEFAULT_REPORT_INTERVAL_SECS),
        )
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node_id.is_empty() {
            return Err(NodeError::Config("empty node_id".into()));
        }
        if self.control_url.is_empty() && self.relays.is_empty() {
            return Err(NodeError::Config(
                "neither control_url nor static relays configured".into(),
            ));
        }
        for relay in &self.relays {
            relay.validate()?;
        }
        Ok(())
    }
}

/// Exponential backoff reconnect configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

/// Tunnel settings shared by every encrypted rule on this node. The remote
/// address comes from the rule's selected target, everything else from here.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelTemplate {
    #[serde(default)]
    pub kind: TunnelKind,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub tls_sni: Option<String>,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    #[serde(default)]
    pub tls_ca: Option<String>,
    #[serde(default)]
    pub tls_client_cert: Option<String>,
    #[serde(default)]
    pub tls_client_key: Option<String>,

    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub max_message_size: Option<usize>,
}

impl TunnelTemplate {
    /// Instantiate a tunnel config for one remote endpoint.
    pub fn to_tunnel_config(&self, remote_addr: &str, remote_port: u16) -> TunnelConfig {
        TunnelConfig {
            kind: self.kind,
            remote_addr: remote_addr.to_string(),
            remote_port,
            path: self
                .path
                .clone()
                .unwrap_or_else(|| defaults::DEFAULT_WS_PATH.to_string()),
            tls_sni: self.tls_sni.clone(),
            tls_insecure_skip_verify: self.tls_insecure_skip_verify,
            tls_ca: self.tls_ca.clone(),
            tls_client_cert: self.tls_client_cert.clone(),
            tls_client_key: self.tls_client_key.clone(),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(defaults::DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout_secs: defaults::DEFAULT_TUNNEL_READ_TIMEOUT_SECS,
            write_timeout_secs: defaults::DEFAULT_TUNNEL_WRITE_TIMEOUT_SECS,
            ping_interval_secs: defaults::DEFAULT_TUNNEL_PING_INTERVAL_SECS,
            keepalive_secs: self.keepalive_secs,
            max_message_size: self
                .max_message_size
                .unwrap_or(defaults::DEFAULT_WS_MAX_MESSAGE_SIZE),
            reconnect_interval_secs: defaults::DEFAULT_TUNNEL_RECONNECT_INTERVAL_SECS,
            max_reconnects: defaults::DEFAULT_TUNNEL_MAX_RECONNECTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes() {
        let toml_str = r#"
node_id = "node-a"
control_url = "wss://control.example.com/ws/node"
token = "test-token"
"#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_id, "node-a");
        assert!(config.tunnel.is_none());
        assert!(config.relays.is_empty());
        assert_eq!(config.reconnect.initial_delay_ms, 1000);
        assert_eq!(
            config.report_interval(),
            std::time::Duration::from_secs(30)
        );
    }

    #[test]
    fn full_config_deserializes() {
        let toml_str = r#"
node_id = "node-a"
control_url = "wss://control.example.com/ws/node"
token = "test-token"
log_level = "debug"
metrics_listen = "127.0.0.1:9100"
report_interval_secs = 15

[reconnect]
initial_delay_ms = 500
max_delay_ms = 30000
multiplier = 1.5
jitter = 0.2

[tunnel]
kind = "wss"
path = "/tunnel"
tls_sni = "relay.example.net"
keepalive_secs = 60

[[relays]]
name = "static-1"
listen_port = 18080
target_addr = "10.0.0.9"
target_port = 80
"#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.report_interval_secs, Some(15));
        assert_eq!(config.reconnect.max_delay_ms, 30_000);

        let template = config.tunnel.unwrap();
        assert_eq!(template.kind, TunnelKind::Wss);
        let tunnel = template.to_tunnel_config("10.0.0.5", 8443);
        assert_eq!(tunnel.remote(), "10.0.0.5:8443");
        assert_eq!(tunnel.sni(), "relay.example.net");
        assert_eq!(tunnel.keepalive_secs, 60);
        tunnel.validate().unwrap();

        assert_eq!(config.relays.len(), 1);
        assert_eq!(config.relays[0].name, "static-1");
    }

    #[test]
    fn validate_rejects_empty_node_id() {
        let config: NodeConfig = toml::from_str(
            r#"
node_id = ""
control_url = "wss://c"
token = "t"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
