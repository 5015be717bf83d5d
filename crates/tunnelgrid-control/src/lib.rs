//! Control-plane side of tunnelgrid: the node wire protocol, rule
//! distribution, failover event ingestion, and the read-only query API.

pub mod api;
pub mod error;
pub mod failover;
pub mod protocol;
pub mod sync;

pub use error::ControlError;
pub use failover::{EventStore, FailoverEvent, FailoverService, GroupSummary, MemoryEventStore};
pub use protocol::{
    decode, encode, FailoverEventReport, FailoverEventType, NodeMessage, PlaneMessage,
    RelayStatsReport, RuleTarget, StatsReport, SyncRulePayload,
};
pub use sync::{
    GroupDirectory, KeyProvider, MemoryRuleVersions, RuleSender, RuleSyncService, RuleVersions,
    TunnelRule,
};
