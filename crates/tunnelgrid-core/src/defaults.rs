//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Relay Buffer Defaults
// ============================================================================

/// Default TCP relay buffer size per direction (32 KiB).
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 32 * 1024;
/// Default UDP datagram buffer size (64 KiB, one max-size datagram).
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Default TCP idle timeout in seconds (5 minutes).
pub const DEFAULT_TCP_IDLE_TIMEOUT_SECS: u64 = 300;
/// Default UDP session idle timeout in seconds (2 minutes).
pub const DEFAULT_UDP_IDLE_TIMEOUT_SECS: u64 = 120;
/// Default target dial timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Per-write deadline applied by relay copy loops, in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;
/// Bounded grace period for in-flight connections during shutdown.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// UDP Session Defaults
// ============================================================================

/// Interval between idle-session sweep passes, in seconds.
pub const UDP_SWEEP_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Load Balancer Defaults
// ============================================================================

/// Consecutive failures before a backend is marked unhealthy.
pub const DEFAULT_MAX_FAIL_COUNT: u32 = 3;

// ============================================================================
// Tunnel Transport Defaults
// ============================================================================

/// Default WebSocket upgrade path.
pub const DEFAULT_WS_PATH: &str = "/tunnel";
/// Default max WebSocket message size (1 MiB).
pub const DEFAULT_WS_MAX_MESSAGE_SIZE: usize = 1 << 20;
/// Default tunnel read timeout in seconds.
pub const DEFAULT_TUNNEL_READ_TIMEOUT_SECS: u64 = 60;
/// Default tunnel write timeout in seconds.
pub const DEFAULT_TUNNEL_WRITE_TIMEOUT_SECS: u64 = 30;
/// Default tunnel keepalive ping interval in seconds.
pub const DEFAULT_TUNNEL_PING_INTERVAL_SECS: u64 = 30;
/// Default delay between tunnel reconnect attempts, in seconds.
pub const DEFAULT_TUNNEL_RECONNECT_INTERVAL_SECS: u64 = 5;
/// Default maximum tunnel reconnect attempts (0 = unlimited).
pub const DEFAULT_TUNNEL_MAX_RECONNECTS: u32 = 0;

// ============================================================================
// Failover Defaults
// ============================================================================

/// Sustained failure duration before a node switches egress, in seconds.
pub const DEFAULT_FAILOVER_TIMEOUT_SECS: u64 = 30;
/// Interval between primary-recovery probes, in seconds.
pub const FAILOVER_PROBE_INTERVAL_SECS: u64 = 10;

// ============================================================================
// Reporting Defaults
// ============================================================================

/// Default interval between stats reports to the control plane, in seconds.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 30;
/// Default failover history page size.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
/// Maximum failover history page size.
pub const MAX_HISTORY_LIMIT: usize = 100;
