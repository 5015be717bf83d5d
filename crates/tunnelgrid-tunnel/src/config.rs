//! Tunnel client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tunnelgrid_core::defaults;

use crate::error::TunnelError;

/// Transport kind for the encrypted tunnel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// Plain TCP, no encryption. Useful for tests and trusted networks.
    Tcp,
    #[default]
    Tls,
    Ws,
    Wss,
}

impl TunnelKind {
    pub fn uses_tls(self) -> bool {
        matches!(self, TunnelKind::Tls | TunnelKind::Wss)
    }

    pub fn uses_websocket(self) -> bool {
        matches!(self, TunnelKind::Ws | TunnelKind::Wss)
    }
}

/// Configuration for one tunnel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub kind: TunnelKind,

    pub remote_addr: String,
    pub remote_port: u16,

    /// WebSocket upgrade path (ws/wss only).
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// SNI override; defaults to `remote_addr`.
    #[serde(default)]
    pub tls_sni: Option<String>,

    /// Accept any server certificate. For self-signed relay links only.
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,

    /// Pinned root CA (PEM path). Replaces the webpki root store.
    #[serde(default)]
    pub tls_ca: Option<String>,

    /// Client certificate for mutual TLS (PEM paths).
    #[serde(default)]
    pub tls_client_cert: Option<String>,
    #[serde(default)]
    pub tls_client_key: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// TCP keepalive period in seconds (0 = kernel default).
    #[serde(default)]
    pub keepalive_secs: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Maximum reconnect attempts before giving up (0 = unlimited).
    #[serde(default)]
    pub max_reconnects: u32,
}

impl TunnelConfig {
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_addr, self.remote_port)
    }

    /// Hostname presented as SNI.
    pub fn sni(&self) -> &str {
        self.tls_sni.as_deref().unwrap_or(&self.remote_addr)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    /// WebSocket URL for the ws/wss kinds.
    pub fn ws_url(&self) -> String {
        let scheme = match self.kind {
            TunnelKind::Wss => "wss",
            _ => "ws",
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}{}", scheme, self.remote(), path)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.remote_addr.is_empty() {
            return Err(TunnelError::Config("empty remote address".into()));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::Config("remote port must be non-zero".into()));
        }
        if self.tls_client_cert.is_some() != self.tls_client_key.is_some() {
            return Err(TunnelError::Config(
                "client cert and key must both be set".into(),
            ));
        }
        Ok(())
    }
}

fn default_ws_path() -> String {
    defaults::DEFAULT_WS_PATH.to_string()
}

fn default_connect_timeout() -> u64 {
    defaults::DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_read_timeout() -> u64 {
    defaults::DEFAULT_TUNNEL_READ_TIMEOUT_SECS
}

fn default_write_timeout() -> u64 {
    defaults::DEFAULT_TUNNEL_WRITE_TIMEOUT_SECS
}

fn default_ping_interval() -> u64 {
    defaults::DEFAULT_TUNNEL_PING_INTERVAL_SECS
}

fn default_max_message_size() -> usize {
    defaults::DEFAULT_WS_MAX_MESSAGE_SIZE
}

fn default_reconnect_interval() -> u64 {
    defaults::DEFAULT_TUNNEL_RECONNECT_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_toml() {
        let config: TunnelConfig = toml::from_str(
            r#"
kind = "wss"
remote_addr = "relay.example.net"
remote_port = 443
"#,
        )
        .unwrap();
        assert_eq!(config.kind, TunnelKind::Wss);
        assert_eq!(config.path, "/tunnel");
        assert_eq!(config.ws_url(), "wss://relay.example.net:443/tunnel");
        assert_eq!(config.sni(), "relay.example.net");
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_lone_client_cert() {
        let mut config: TunnelConfig = toml::from_str(
            r#"
remote_addr = "10.0.0.1"
remote_port = 8443
"#,
        )
        .unwrap();
        config.tls_client_cert = Some("/tmp/cert.pem".into());
        assert!(config.validate().is_err());
    }
}
