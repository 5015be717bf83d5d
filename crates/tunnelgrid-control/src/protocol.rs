//! Wire protocol between the control plane and nodes.
//!
//! Frames are JSON objects carried as WebSocket text messages, internally
//! tagged with a `type` field. The plane pushes rule updates down; nodes
//! push failover events and periodic stats reports up. Unknown fields are
//! ignored on decode so either side can be upgraded first.

use serde::{Deserialize, Serialize};

use tunnelgrid_core::stats::StatsSnapshot;
use tunnelgrid_lb::LbStrategy;

use crate::error::ControlError;

/// One load-balancing target inside a rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleTarget {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Accept a version as a JSON number or a numeric string. Older plane
/// builds serialized versions as strings; we always emit numbers.
fn lenient_version<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct VersionVisitor;

    impl serde::de::Visitor<'_> for VersionVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a version number or numeric string")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("version must be non-negative"))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse()
                .map_err(|_| E::custom(format!("invalid version string {v:?}")))
        }
    }

    deserializer.deserialize_any(VersionVisitor)
}

/// Full relay rule as pushed to a node.
///
/// `version` increases monotonically per tunnel; a node that already
/// applied an equal or newer version treats the payload as a no-op unless
/// the enclosing frame is forced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRulePayload {
    pub tunnel_id: String,
    /// "tcp" or "udp".
    pub protocol: String,
    pub listen_port: u16,
    pub targets: Vec<RuleTarget>,
    #[serde(default)]
    pub lb_strategy: LbStrategy,

    #[serde(default)]
    pub enable_encryption: bool,
    /// Present only when encryption is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    #[serde(default)]
    pub rate_limit_bps: u64,
    #[serde(default)]
    pub max_connections: u64,
    /// Idle timeout in seconds (0 = protocol default).
    #[serde(default)]
    pub idle_timeout: u64,

    #[serde(deserialize_with = "lenient_version")]
    pub version: u64,

    #[serde(default)]
    pub failover_targets: Vec<RuleTarget>,
    /// Sustained-failure window before the node switches, in seconds.
    #[serde(default)]
    pub failover_timeout: u64,
    #[serde(default)]
    pub failover_auto_recover: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_group_id: Option<String>,
}

/// Frames pushed from the control plane to nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaneMessage {
    SyncRules {
        rules: Vec<SyncRulePayload>,
        #[serde(default)]
        force: bool,
        #[serde(deserialize_with = "lenient_version")]
        version: u64,
    },
    DeleteRule {
        tunnel_id: String,
    },
}

/// Failover/recovery notification from a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailoverEventReport {
    pub node_id: String,
    pub tunnel_id: String,
    pub event_type: FailoverEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_group_id: Option<String>,
    pub reason: String,
    /// How long the primary had been failing before the switch, in seconds.
    #[serde(default)]
    pub failure_duration_secs: u64,
    /// Unix timestamp of the event on the node.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailoverEventType {
    Failover,
    Recovery,
}

impl FailoverEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            FailoverEventType::Failover => "failover",
            FailoverEventType::Recovery => "recovery",
        }
    }
}

/// Per-relay counters inside a stats report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayStatsReport {
    pub tunnel_id: String,
    #[serde(flatten)]
    pub counters: StatsSnapshot,
}

/// Periodic node telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub node_id: String,
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub relays: Vec<RelayStatsReport>,
    pub timestamp: i64,
}

/// Frames pushed from nodes to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    FailoverEvent(FailoverEventReport),
    StatsReport(StatsReport),
}

/// Encode a frame for the wire.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ControlError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from the wire.
pub fn decode<'a, T: Deserialize<'a>>(raw: &'a str) -> Result<T, ControlError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> SyncRulePayload {
        SyncRulePayload {
            tunnel_id: "tun-1".into(),
            protocol: "tcp".into(),
            listen_port: 8443,
            targets: vec![RuleTarget {
                host: "10.0.0.5".into(),
                port: 443,
                weight: 2,
            }],
            lb_strategy: LbStrategy::RoundRobin,
            enable_encryption: false,
            encryption_key: None,
            rate_limit_bps: 0,
            max_connections: 0,
            idle_timeout: 0,
            version: 7,
            failover_targets: vec![],
            failover_timeout: 30,
            failover_auto_recover: true,
            failover_group_id: None,
        }
    }

    #[test]
    fn sync_rules_frame_is_tagged() {
        let frame = PlaneMessage::SyncRules {
            rules: vec![sample_rule()],
            force: false,
            version: 7,
        };
        let raw = encode(&frame).unwrap();
        assert!(raw.contains(r#""type":"sync_rules""#), "{}", raw);
        assert!(raw.contains(r#""tunnel_id":"tun-1""#));
        // No key material when encryption is off.
        assert!(!raw.contains("encryption_key"));

        let decoded: PlaneMessage = decode(&raw).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn delete_rule_frame_round_trips() {
        let frame = PlaneMessage::DeleteRule {
            tunnel_id: "tun-9".into(),
        };
        let raw = encode(&frame).unwrap();
        assert!(raw.contains(r#""type":"delete_rule""#));
        assert_eq!(decode::<PlaneMessage>(&raw).unwrap(), frame);
    }

    #[test]
    fn failover_event_frame_round_trips() {
        let frame = NodeMessage::FailoverEvent(FailoverEventReport {
            node_id: "node-a".into(),
            tunnel_id: "tun-1".into(),
            event_type: FailoverEventType::Failover,
            from_group_id: Some("g-primary".into()),
            to_group_id: Some("g-backup".into()),
            reason: "all targets unhealthy".into(),
            failure_duration_secs: 31,
            timestamp: 1_700_000_000,
        });
        let raw = encode(&frame).unwrap();
        assert!(raw.contains(r#""type":"failover_event""#), "{}", raw);
        assert!(raw.contains(r#""event_type":"failover""#));
        assert_eq!(decode::<NodeMessage>(&raw).unwrap(), frame);
    }

    #[test]
    fn decoder_ignores_unknown_fields() {
        let raw = r#"{"type":"delete_rule","tunnel_id":"t","future_field":42}"#;
        let decoded: PlaneMessage = decode(raw).unwrap();
        assert_eq!(
            decoded,
            PlaneMessage::DeleteRule {
                tunnel_id: "t".into()
            }
        );
    }

    #[test]
    fn missing_version_is_rejected() {
        let raw = r#"{"type":"sync_rules","rules":[],"force":false}"#;
        assert!(decode::<PlaneMessage>(raw).is_err());
    }

    #[test]
    fn string_versions_decode_as_numbers() {
        let raw = concat!(
            r#"{"type":"sync_rules","force":false,"version":"12","rules":["#,
            r#"{"tunnel_id":"t","protocol":"tcp","listen_port":1,"#,
            r#""targets":[{"host":"h","port":2}],"version":"9"}]}"#,
        );
        let decoded: PlaneMessage = decode(raw).unwrap();
        match decoded {
            PlaneMessage::SyncRules {
                rules, version, ..
            } => {
                assert_eq!(version, 12);
                assert_eq!(rules[0].version, 9);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn non_numeric_version_string_is_rejected() {
        let raw = r#"{"type":"sync_rules","rules":[],"force":false,"version":"latest"}"#;
        assert!(decode::<PlaneMessage>(raw).is_err());
    }
}
