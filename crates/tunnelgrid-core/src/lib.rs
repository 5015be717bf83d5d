//! Core primitives shared by the tunnelgrid relay engine and node binary.
//!
//! This crate carries no policy: defaults, monotonic statistics counters,
//! and the bidirectional copy engine that every relay variant (TCP, UDP
//! reverse path, encrypted tunnel bridge) is built on.

pub mod defaults;
pub mod io;
pub mod stats;
pub mod tracker;

/// Crate version, reported to the control plane at registration.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
