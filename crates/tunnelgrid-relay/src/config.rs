//! Relay configuration shared by the TCP and UDP engines.
//!
//! Authored by the control plane (flattened from a rule payload) or by the
//! node's static TOML config; the relay itself only consumes it.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tunnelgrid_core::defaults;

use crate::error::RelayError;

/// Relay protocol selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Configuration for one relay instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Human-readable name for logging.
    pub name: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    pub listen_port: u16,

    pub target_addr: String,
    pub target_port: u16,

    #[serde(default)]
    pub protocol: RelayProtocol,

    /// Relay buffer size per direction (bytes). Zero selects the protocol
    /// default (32 KiB TCP, 64 KiB UDP).
    #[serde(default)]
    pub buffer_size: usize,

    /// Maximum concurrent connections/sessions (0 = unlimited).
    #[serde(default)]
    pub max_connections: u64,

    /// Idle timeout in seconds. Zero selects the protocol default
    /// (5 min TCP, 2 min UDP).
    #[serde(default)]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_conn_timeout")]
    pub conn_timeout_secs: u64,

    /// Byte-rate cap per connection direction (0 = unlimited).
    #[serde(default)]
    pub rate_limit_bps: u64,

    /// Whether traffic to the target should ride an encrypted tunnel.
    /// Consumed by the node engine, not by the relay itself.
    #[serde(default)]
    pub enable_encrypt: bool,

    /// Tunnel transport kind when `enable_encrypt` is set
    /// (tcp | tls | ws | wss).
    #[serde(default)]
    pub encrypt_method: Option<String>,
}

impl RelayConfig {
    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_addr, self.target_port)
    }

    pub fn buffer_size(&self) -> usize {
        if self.buffer_size > 0 {
            self.buffer_size
        } else {
            match self.protocol {
                RelayProtocol::Tcp => defaults::DEFAULT_TCP_BUFFER_SIZE,
                RelayProtocol::Udp => defaults::DEFAULT_UDP_BUFFER_SIZE,
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        let secs = if self.idle_timeout_secs > 0 {
            self.idle_timeout_secs
        } else {
            match self.protocol {
                RelayProtocol::Tcp => defaults::DEFAULT_TCP_IDLE_TIMEOUT_SECS,
                RelayProtocol::Udp => defaults::DEFAULT_UDP_IDLE_TIMEOUT_SECS,
            }
        };
        Duration::from_secs(secs)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs.max(1))
    }

    /// Fail fast on configurations the relay cannot run.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.target_addr.is_empty() {
            return Err(RelayError::Config(format!(
                "relay {}: empty target address",
                self.name
            )));
        }
        if self.target_port == 0 {
            return Err(RelayError::Config(format!(
                "relay {}: target port must be non-zero",
                self.name
            )));
        }
        if self.enable_encrypt {
            match self.encrypt_method.as_deref() {
                Some("tcp") | Some("tls") | Some("ws") | Some("wss") => {}
                other => {
                    return Err(RelayError::Config(format!(
                        "relay {}: unsupported encrypt method {:?}",
                        self.name, other
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_listen_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_conn_timeout() -> u64 {
    defaults::DEFAULT_CONNECT_TIMEOUT_SECS
}
