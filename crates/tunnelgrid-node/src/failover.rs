//! Autonomous failover monitor.
//!
//! One monitor per rule that carries failover targets. It watches the
//! rule's balancer; once every primary target has been unhealthy for the
//! configured window, it swaps the pool to the failover targets and
//! reports the switch upstream. The control plane is informed, never
//! consulted: a node keeps relaying through its failover group even when
//! the uplink is down.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelgrid_core::defaults;
use tunnelgrid_lb::LoadBalancer;
use tunnelgrid_control::{FailoverEventReport, FailoverEventType, NodeMessage, RuleTarget};

const RECOVERY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct FailoverMonitor {
    node_id: String,
    tunnel_id: String,
    balancer: Arc<LoadBalancer>,
    primary: Vec<RuleTarget>,
    failover: Vec<RuleTarget>,
    failover_timeout: Duration,
    auto_recover: bool,
    group_id: Option<String>,
    events: mpsc::Sender<NodeMessage>,
    /// Tick period; defaults to the probe interval constant.
    probe_interval: Duration,
}

impl FailoverMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        tunnel_id: String,
        balancer: Arc<LoadBalancer>,
        primary: Vec<RuleTarget>,
        failover: Vec<RuleTarget>,
        failover_timeout_secs: u64,
        auto_recover: bool,
        group_id: Option<String>,
        events: mpsc::Sender<NodeMessage>,
    ) -> Self {
        let timeout_secs = if failover_timeout_secs > 0 {
            failover_timeout_secs
        } else {
            defaults::DEFAULT_FAILOVER_TIMEOUT_SECS
        };
        Self {
            node_id,
            tunnel_id,
            balancer,
            primary,
            failover,
            failover_timeout: Duration::from_secs(timeout_secs),
            auto_recover,
            group_id,
            events,
            probe_interval: Duration::from_secs(defaults::FAILOVER_PROBE_INTERVAL_SECS),
        }
    }

    #[cfg(test)]
    fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut unhealthy_since: Option<Instant> = None;
        let mut failed_over = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!(tunnel = %self.tunnel_id, "failover monitor shutting down");
                    return;
                }

                _ = ticker.tick() => {
                    if !failed_over {
                        if self.balancer.all_unhealthy() {
                            let since = *unhealthy_since.get_or_insert_with(Instant::now);
                            let down_for = since.elapsed();
                            if down_for >= self.failover_timeout {
                                self.switch_to_failover(down_for).await;
                                failed_over = true;
                                unhealthy_since = None;
                            }
                        } else {
                            unhealthy_since = None;
                        }
                    } else if self.auto_recover {
                        if let Some(target) = self.probe_primary().await {
                            self.switch_back(&target).await;
                            failed_over = false;
                        }
                    }
                }
            }
        }
    }

    /// Replace the primary pool with the failover targets.
    async fn switch_to_failover(&self, down_for: Duration) {
        for target in &self.primary {
            self.balancer.remove_backend(&target.host, target.port);
        }
        for target in &self.failover {
            self.balancer
                .add_backend(target.host.clone(), target.port, target.weight);
        }

        warn!(
            tunnel = %self.tunnel_id,
            group = self.group_id.as_deref().unwrap_or("-"),
            down_secs = down_for.as_secs(),
            "all primary targets down, switching to failover group"
        );

        self.emit(
            FailoverEventType::Failover,
            None,
            self.group_id.clone(),
            "all primary targets unhealthy".into(),
            down_for.as_secs(),
        )
        .await;
    }

    /// Restore the primary pool after a successful probe of `target`.
    async fn switch_back(&self, target: &RuleTarget) {
        for failover in &self.failover {
            self.balancer.remove_backend(&failover.host, failover.port);
        }
        for primary in &self.primary {
            self.balancer
                .add_backend(primary.host.clone(), primary.port, primary.weight);
        }

        info!(
            tunnel = %self.tunnel_id,
            primary = %format!("{}:{}", target.host, target.port),
            "primary reachable again, switching back"
        );

        self.emit(
            FailoverEventType::Recovery,
            self.group_id.clone(),
            None,
            format!("primary {}:{} reachable", target.host, target.port),
            0,
        )
        .await;
    }

    /// TCP-probe the primary targets; returns the first reachable one.
    async fn probe_primary(&self) -> Option<RuleTarget> {
        for target in &self.primary {
            let addr = format!("{}:{}", target.host, target.port);
            let dial = tokio::time::timeout(RECOVERY_PROBE_TIMEOUT, TcpStream::connect(&addr));
            if matches!(dial.await, Ok(Ok(_))) {
                return Some(target.clone());
            }
            debug!(tunnel = %self.tunnel_id, target = %addr, "recovery probe failed");
        }
        None
    }

    async fn emit(
        &self,
        event_type: FailoverEventType,
        from_group_id: Option<String>,
        to_group_id: Option<String>,
        reason: String,
        failure_duration_secs: u64,
    ) {
        let report = NodeMessage::FailoverEvent(FailoverEventReport {
            node_id: self.node_id.clone(),
            tunnel_id: self.tunnel_id.clone(),
            event_type,
            from_group_id,
            to_group_id,
            reason,
            failure_duration_secs,
            timestamp: unix_now(),
        });
        // The event channel outlives uplink sessions; a full buffer only
        // drops the report, never blocks the data path.
        if let Err(e) = self.events.try_send(report) {
            warn!(tunnel = %self.tunnel_id, error = %e, "failover event not queued");
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
