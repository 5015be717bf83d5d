//! Metrics collection and Prometheus exporter for tunnelgrid.
//!
//! Thin facade over the `metrics` crate: name constants plus `record_*`
//! helpers, so relay and control-plane code never touches metric names
//! directly.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize the Prometheus metrics exporter.
///
/// Starts an HTTP server on the given address to expose metrics.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Total connections accepted by relays.
pub const CONNECTIONS_TOTAL: &str = "tunnelgrid_connections_total";
/// Currently active relayed connections.
pub const CONNECTIONS_ACTIVE: &str = "tunnelgrid_connections_active";
/// Connections rejected or failed, labeled by reason.
pub const CONNECTIONS_FAILED_TOTAL: &str = "tunnelgrid_connections_failed_total";
/// Bytes relayed client→target.
pub const BYTES_IN_TOTAL: &str = "tunnelgrid_bytes_in_total";
/// Bytes relayed target→client.
pub const BYTES_OUT_TOTAL: &str = "tunnelgrid_bytes_out_total";
/// Currently tracked UDP sessions.
pub const UDP_SESSIONS_ACTIVE: &str = "tunnelgrid_udp_sessions_active";
/// UDP sessions reaped by idle timeout.
pub const UDP_SESSIONS_REAPED_TOTAL: &str = "tunnelgrid_udp_sessions_reaped_total";
/// Rule payloads pushed to nodes, labeled by message type.
pub const RULE_PUSHES_TOTAL: &str = "tunnelgrid_rule_pushes_total";
/// Rule pushes skipped because the node had no live connection.
pub const RULE_PUSHES_SKIPPED_TOTAL: &str = "tunnelgrid_rule_pushes_skipped_total";
/// Failover events ingested, labeled by event type.
pub const FAILOVER_EVENTS_TOTAL: &str = "tunnelgrid_failover_events_total";
/// Pairs currently failed over.
pub const FAILOVERS_ACTIVE: &str = "tunnelgrid_failovers_active";

// ============================================================================
// Failure Reasons
// ============================================================================

pub const REASON_CAPACITY: &str = "capacity";
pub const REASON_DIAL: &str = "dial";
pub const REASON_SESSION_LIMIT: &str = "session_limit";
pub const REASON_NO_BACKEND: &str = "no_backend";

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a relayed connection accepted.
#[inline]
pub fn record_connection_accepted() {
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a relayed connection closed.
#[inline]
pub fn record_connection_closed() {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a failed/rejected connection with a reason label.
#[inline]
pub fn record_connection_failed(reason: &'static str) {
    counter!(CONNECTIONS_FAILED_TOTAL, "reason" => reason).increment(1);
}

/// Record bytes relayed client→target.
#[inline]
pub fn record_bytes_in(bytes: u64) {
    counter!(BYTES_IN_TOTAL).increment(bytes);
}

/// Record bytes relayed target→client.
#[inline]
pub fn record_bytes_out(bytes: u64) {
    counter!(BYTES_OUT_TOTAL).increment(bytes);
}

/// Record a UDP session created.
#[inline]
pub fn record_udp_session_opened() {
    gauge!(UDP_SESSIONS_ACTIVE).increment(1.0);
}

/// Record a UDP session removed; `reaped` marks idle-timeout removal.
#[inline]
pub fn record_udp_session_closed(reaped: bool) {
    gauge!(UDP_SESSIONS_ACTIVE).decrement(1.0);
    if reaped {
        counter!(UDP_SESSIONS_REAPED_TOTAL).increment(1);
    }
}

/// Record a rule payload pushed to a node.
#[inline]
pub fn record_rule_push(kind: &'static str) {
    counter!(RULE_PUSHES_TOTAL, "type" => kind).increment(1);
}

/// Record a rule push skipped for a disconnected node.
#[inline]
pub fn record_rule_push_skipped() {
    counter!(RULE_PUSHES_SKIPPED_TOTAL).increment(1);
}

/// Record a failover event ingested.
#[inline]
pub fn record_failover_event(event_type: &'static str) {
    counter!(FAILOVER_EVENTS_TOTAL, "type" => event_type).increment(1);
}

/// Update the active-failover gauge.
#[inline]
pub fn set_failovers_active(count: f64) {
    gauge!(FAILOVERS_ACTIVE).set(count);
}
