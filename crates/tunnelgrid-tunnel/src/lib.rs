//! Encrypted tunnel transports for tunnelgrid.
//!
//! Four transports share one stream type: plain TCP, TLS, WebSocket, and
//! WebSocket over TLS. [`connect`] performs the handshakes; the
//! [`TunnelRelayBridge`] plugs tunnels into the bidirectional relay so a
//! local port can be forwarded through an encrypted hop.

pub mod bridge;
pub mod config;
pub mod error;
pub mod stream;
pub mod tls;
pub mod ws;

pub use bridge::{bridge_to_conn, BridgeConfig, TunnelRelayBridge};
pub use config::{TunnelConfig, TunnelKind};
pub use error::TunnelError;
pub use stream::{connect, TunnelStream};
pub use ws::WsStream;
