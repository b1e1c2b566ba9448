//! Cross-process signal envelope.
//!
//! Remote mesh processes (and sidecar agents) talk to the control API by
//! POSTing signals. A heartbeat keeps an endpoint registered, a mapping
//! snapshot replaces the service-name routing table, and a circuit state
//! signal mirrors a breaker decision made elsewhere so every process
//! gates calls the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use meshwork_state::{AppId, CircuitState, EndpointStatus, InstanceId};

/// Periodic liveness report from a running instance.
///
/// Only `app_id` is required on the wire; the heartbeat API route fills
/// `instance_id` from the path, and the signal channel rejects heartbeats
/// without one. An unknown instance is registered on first heartbeat with
/// defaults filled from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSignal {
    pub app_id: AppId,
    #[serde(default)]
    pub instance_id: InstanceId,
    #[serde(default)]
    pub status: Option<EndpointStatus>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub service_names: Vec<String>,
    #[serde(default)]
    pub load_percent: u8,
    #[serde(default)]
    pub current_connections: u32,
    /// Connection capacity, when the instance knows it.
    #[serde(default)]
    pub max_connections: Option<u32>,
    /// Issues currently reported by the instance; replaces the stored set.
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Envelope for everything a mesh process can send to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Heartbeat(HeartbeatSignal),
    /// Replace the whole service-name to app-id table.
    MappingSnapshot { mappings: BTreeMap<String, AppId> },
    /// Mirror a breaker row decided by another process.
    CircuitState {
        app_id: AppId,
        state: CircuitState,
        consecutive_failures: u32,
        opened_at: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_parses_with_minimal_fields() {
        let json = r#"{"type":"heartbeat","app_id":"auth","instance_id":"i-1"}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        match signal {
            Signal::Heartbeat(hb) => {
                assert_eq!(hb.app_id, "auth");
                assert_eq!(hb.instance_id, "i-1");
                assert_eq!(hb.status, None);
                assert_eq!(hb.host, None);
                assert_eq!(hb.load_percent, 0);
                assert!(hb.issues.is_empty());
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn mapping_snapshot_round_trips() {
        let mut mappings = BTreeMap::new();
        mappings.insert("login".to_string(), "auth".to_string());
        let signal = Signal::MappingSnapshot { mappings };

        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains(r#""type":"mapping_snapshot"#));
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn circuit_state_signal_tags() {
        let json = serde_json::to_value(Signal::CircuitState {
            app_id: "auth".to_string(),
            state: CircuitState::HalfOpen,
            consecutive_failures: 5,
            opened_at: 1_000,
        })
        .unwrap();
        assert_eq!(json["type"], "circuit_state");
        assert_eq!(json["state"], "half_open");
    }
}
