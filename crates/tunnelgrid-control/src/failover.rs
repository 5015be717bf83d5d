//! Passive failover event ingestion.
//!
//! Nodes switch egress on their own; the control plane only learns about it
//! afterwards. Events are append-only facts. The service additionally keeps
//! a derived in-memory index of currently active failovers, rebuilt from
//! the store on startup, so "what is failed over right now" is a map read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::protocol::{FailoverEventReport, FailoverEventType};

/// One ingested failover or recovery event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailoverEvent {
    pub node_id: String,
    pub tunnel_id: String,
    pub event_type: FailoverEventType,
    pub from_group_id: Option<String>,
    pub to_group_id: Option<String>,
    pub reason: String,
    pub failure_duration_secs: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<FailoverEventReport> for FailoverEvent {
    fn from(report: FailoverEventReport) -> Self {
        let timestamp = OffsetDateTime::from_unix_timestamp(report.timestamp)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        Self {
            node_id: report.node_id,
            tunnel_id: report.tunnel_id,
            event_type: report.event_type,
            from_group_id: report.from_group_id,
            to_group_id: report.to_group_id,
            reason: report.reason,
            failure_duration_secs: report.failure_duration_secs,
            timestamp,
        }
    }
}

/// Append-only event persistence.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: FailoverEvent) -> Result<(), ControlError>;
    /// Events for one tunnel, newest first.
    async fn history(&self, tunnel_id: &str, limit: usize)
        -> Result<Vec<FailoverEvent>, ControlError>;
    /// Latest event for every (node, tunnel) pair.
    async fn latest_per_pair(&self) -> Result<Vec<FailoverEvent>, ControlError>;
    /// Events since `since` that involve a group on either side.
    async fn count_since(
        &self,
        group_id: &str,
        since: OffsetDateTime,
    ) -> Result<u64, ControlError>;
}

/// In-memory event store.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<FailoverEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: FailoverEvent) -> Result<(), ControlError> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn history(
        &self,
        tunnel_id: &str,
        limit: usize,
    ) -> Result<Vec<FailoverEvent>, ControlError> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.tunnel_id == tunnel_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_per_pair(&self) -> Result<Vec<FailoverEvent>, ControlError> {
        let events = self.events.lock();
        let mut latest: HashMap<(String, String), FailoverEvent> = HashMap::new();
        for event in events.iter() {
            latest.insert(
                (event.node_id.clone(), event.tunnel_id.clone()),
                event.clone(),
            );
        }
        Ok(latest.into_values().collect())
    }

    async fn count_since(
        &self,
        group_id: &str,
        since: OffsetDateTime,
    ) -> Result<u64, ControlError> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .filter(|e| {
                e.timestamp >= since
                    && (e.from_group_id.as_deref() == Some(group_id)
                        || e.to_group_id.as_deref() == Some(group_id))
            })
            .count() as u64)
    }
}

/// Per-group failover summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub group_id: String,
    pub active_failovers: usize,
    pub events_24h: u64,
}

/// Ingests node-reported events and serves failover state queries.
pub struct FailoverService {
    store: Arc<dyn EventStore>,
    /// (node_id, tunnel_id) → latest failover event, while not recovered.
    active: RwLock<HashMap<(String, String), FailoverEvent>>,
}

impl FailoverService {
    /// Build the service, rebuilding the active index from the store so a
    /// control-plane restart does not forget in-progress failovers.
    pub async fn new(store: Arc<dyn EventStore>) -> Result<Self, ControlError> {
        let mut active = HashMap::new();
        for event in store.latest_per_pair().await? {
            if event.event_type == FailoverEventType::Failover {
                active.insert((event.node_id.clone(), event.tunnel_id.clone()), event);
            }
        }
        tunnelgrid_metrics::set_failovers_active(active.len() as f64);
        Ok(Self {
            store,
            active: RwLock::new(active),
        })
    }

    /// Ingest one event: persist first, then update the derived index.
    /// An event that is stored but not yet indexed is recovered at the
    /// next restart; the reverse would silently lose history.
    pub async fn handle_event(&self, report: FailoverEventReport) -> Result<(), ControlError> {
        let event = FailoverEvent::from(report);
        self.store.append(event.clone()).await?;
        tunnelgrid_metrics::record_failover_event(event.event_type.as_str());

        let key = (event.node_id.clone(), event.tunnel_id.clone());
        let active_count = {
            let mut active = self.active.write();
            match event.event_type {
                FailoverEventType::Failover => {
                    active.insert(key, event.clone());
                }
                FailoverEventType::Recovery => {
                    active.remove(&key);
                }
            }
            active.len()
        };
        tunnelgrid_metrics::set_failovers_active(active_count as f64);

        match event.event_type {
            FailoverEventType::Failover => warn!(
                node_id = %event.node_id,
                tunnel_id = %event.tunnel_id,
                to_group = event.to_group_id.as_deref().unwrap_or("-"),
                reason = %event.reason,
                failure_duration_secs = event.failure_duration_secs,
                "node failed over"
            ),
            FailoverEventType::Recovery => info!(
                node_id = %event.node_id,
                tunnel_id = %event.tunnel_id,
                "node recovered to primary"
            ),
        }
        Ok(())
    }

    /// All currently failed-over (node, tunnel) pairs.
    pub fn active_failovers(&self) -> Vec<FailoverEvent> {
        self.active.read().values().cloned().collect()
    }

    /// Event history for a tunnel, newest first. The page size defaults to
    /// 20 and is capped at 100.
    pub async fn history(
        &self,
        tunnel_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<FailoverEvent>, ControlError> {
        let limit = limit
            .unwrap_or(tunnelgrid_core::defaults::DEFAULT_HISTORY_LIMIT)
            .min(tunnelgrid_core::defaults::MAX_HISTORY_LIMIT);
        self.store.history(tunnel_id, limit).await
    }

    /// Active count plus 24 h event volume for a failover group.
    pub async fn group_summary(&self, group_id: &str) -> Result<GroupSummary, ControlError> {
        let active_failovers = self
            .active
            .read()
            .values()
            .filter(|e| {
                e.from_group_id.as_deref() == Some(group_id)
                    || e.to_group_id.as_deref() == Some(group_id)
            })
            .count();
        let since = OffsetDateTime::now_utc() - time::Duration::hours(24);
        let events_24h = self.store.count_since(group_id, since).await?;
        Ok(GroupSummary {
            group_id: group_id.to_string(),
            active_failovers,
            events_24h,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(
        node: &str,
        tunnel: &str,
        event_type: FailoverEventType,
        ts: i64,
    ) -> FailoverEventReport {
        FailoverEventReport {
            node_id: node.into(),
            tunnel_id: tunnel.into(),
            event_type,
            from_group_id: Some("g-primary".into()),
            to_group_id: Some("g-backup".into()),
            reason: "all targets unhealthy".into(),
            failure_duration_secs: 31,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn failover_then_recovery_leaves_index_empty() {
        let store = Arc::new(MemoryEventStore::new());
        let svc = FailoverService::new(store.clone()).await.unwrap();

        svc.handle_event(report("n1", "t1", FailoverEventType::Failover, 1_700_000_000))
            .await
            .unwrap();
        assert_eq!(svc.active_failovers().len(), 1);

        svc.handle_event(report("n1", "t1", FailoverEventType::Recovery, 1_700_000_100))
            .await
            .unwrap();
        assert!(svc.active_failovers().is_empty());

        // Both events are persisted; recovery removes nothing from history.
        let history = svc.history("t1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, FailoverEventType::Recovery);
        assert_eq!(history[1].event_type, FailoverEventType::Failover);
    }

    #[tokio::test]
    async fn restart_rebuilds_active_index_from_store() {
        let store = Arc::new(MemoryEventStore::new());
        {
            let svc = FailoverService::new(store.clone()).await.unwrap();
            svc.handle_event(report("n1", "t1", FailoverEventType::Failover, 1_700_000_000))
                .await
                .unwrap();
            svc.handle_event(report("n1", "t2", FailoverEventType::Failover, 1_700_000_010))
                .await
                .unwrap();
            svc.handle_event(report("n1", "t2", FailoverEventType::Recovery, 1_700_000_020))
                .await
                .unwrap();
        }

        // New service over the same store: only the unrecovered pair is active.
        let rebuilt = FailoverService::new(store).await.unwrap();
        let active = rebuilt.active_failovers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tunnel_id, "t1");
    }

    #[tokio::test]
    async fn history_limit_defaults_and_caps() {
        let store = Arc::new(MemoryEventStore::new());
        let svc = FailoverService::new(store).await.unwrap();

        for i in 0..150 {
            svc.handle_event(report(
                "n1",
                "t1",
                FailoverEventType::Failover,
                1_700_000_000 + i,
            ))
            .await
            .unwrap();
        }

        assert_eq!(svc.history("t1", None).await.unwrap().len(), 20);
        assert_eq!(svc.history("t1", Some(50)).await.unwrap().len(), 50);
        assert_eq!(svc.history("t1", Some(500)).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn group_summary_counts_active_and_recent() {
        let store = Arc::new(MemoryEventStore::new());
        let svc = FailoverService::new(store).await.unwrap();

        let now = OffsetDateTime::now_utc().unix_timestamp();
        svc.handle_event(report("n1", "t1", FailoverEventType::Failover, now))
            .await
            .unwrap();
        svc.handle_event(report("n2", "t2", FailoverEventType::Failover, now))
            .await
            .unwrap();

        let summary = svc.group_summary("g-backup").await.unwrap();
        assert_eq!(summary.active_failovers, 2);
        assert_eq!(summary.events_24h, 2);

        let unrelated = svc.group_summary("g-other").await.unwrap();
        assert_eq!(unrelated.active_failovers, 0);
        assert_eq!(unrelated.events_24h, 0);
    }
}
