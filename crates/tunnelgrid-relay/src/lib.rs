//! TCP and UDP relay engine for tunnelgrid nodes.
//!
//! A relay binds a listen port and forwards traffic upstream. The upstream
//! is either the single configured target or, when the relay carries a
//! `LoadBalancer`, chosen per connection from the rule's healthy targets.
//! TCP connections are bridged bidirectionally; UDP datagrams are
//! demultiplexed into per-client sessions, each bound to a dedicated
//! upstream socket.

pub mod config;
pub mod error;
pub mod tcp;
pub mod udp;

pub use config::{RelayConfig, RelayProtocol};
pub use error::RelayError;
pub use tcp::TcpRelay;
pub use udp::UdpRelay;
