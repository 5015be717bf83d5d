//! Tunnelgrid relay node — connects to the control plane over WebSocket,
//! applies pushed relay rules, forwards traffic (optionally through
//! encrypted tunnels), fails over autonomously, and reports stats back.
//!
//! # Usage
//!
//! ```bash
//! tunnelgrid-node -c node.toml
//! ```
//!
//! The node TOML only needs `node_id`, `control_url`, and `token`; relay
//! rules arrive over the uplink. Static `[[relays]]` entries run without a
//! control plane.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod failover;
pub mod reporter;
pub mod uplink;

pub use cli::NodeArgs;
pub use error::NodeError;
