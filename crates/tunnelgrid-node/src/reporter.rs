//! Periodic stats reporter.
//!
//! Sends a `stats_report` frame with host cpu/memory and per-tunnel relay
//! counters at the configured interval, until the session ends.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sysinfo::System;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tunnelgrid_control::{NodeMessage, StatsReport};

use crate::engine::RuleEngine;

pub async fn run_reporter(
    tx: mpsc::Sender<NodeMessage>,
    engine: Arc<RuleEngine>,
    node_id: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut sys = System::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("reporter shutting down");
                return;
            }

            _ = ticker.tick() => {
                sys.refresh_memory();
                sys.refresh_cpu_usage();

                let cpu_percent = {
                    let cpus = sys.cpus();
                    if cpus.is_empty() {
                        0.0
                    } else {
                        let total: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
                        total / cpus.len() as f32
                    }
                };

                let report = NodeMessage::StatsReport(StatsReport {
                    node_id: node_id.clone(),
                    cpu_percent,
                    memory_used_bytes: sys.used_memory(),
                    memory_total_bytes: sys.total_memory(),
                    relays: engine.snapshots().await,
                    timestamp: unix_now(),
                });

                if let Err(e) = tx.send(report).await {
                    warn!(error = %e, "stats channel closed, reporter exiting");
                    return;
                }
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_flow_until_cancelled() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let engine = Arc::new(RuleEngine::new("node-test".into(), None, events_tx));

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_reporter(
            tx,
            engine,
            "node-test".into(),
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let NodeMessage::StatsReport(report) = first else {
            panic!("expected stats report");
        };
        assert_eq!(report.node_id, "node-test");
        assert!(report.relays.is_empty());
        assert!(report.timestamp > 0);

        shutdown.cancel();
        let _ = handle.await;
    }
}
