//! Mesh lifecycle events.

use serde::{Deserialize, Serialize};

use meshwork_state::{AppId, CircuitState, InstanceId};

/// Why an endpoint left the registry. TTL expiry removes records without
/// an event; these reasons cover explicit removal only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregisterReason {
    /// The instance deregistered itself.
    Graceful,
    /// The health worker gave up on the instance.
    HealthCheckFailed,
    /// Removed after an unrecoverable error was observed.
    Error,
}

/// Why an endpoint was marked degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// No heartbeat within the degradation threshold.
    MissedHeartbeat,
    /// Reported load crossed the high-load mark.
    HighLoad,
    /// Connections reached the instance's capacity.
    HighConnections,
}

/// A lifecycle transition observed by the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    EndpointRegistered {
        app_id: AppId,
        instance_id: InstanceId,
    },
    EndpointDeregistered {
        app_id: AppId,
        instance_id: InstanceId,
        reason: DeregisterReason,
    },
    EndpointDegraded {
        app_id: AppId,
        instance_id: InstanceId,
        reason: DegradeReason,
    },
    EndpointHealthCheckFailed {
        app_id: AppId,
        instance_id: InstanceId,
        consecutive_failures: u32,
    },
    CircuitStateChanged {
        app_id: AppId,
        state: CircuitState,
        consecutive_failures: u32,
    },
    MappingsReplaced {
        version: u64,
        count: usize,
    },
}

impl MeshEvent {
    /// Short stable name for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::EndpointRegistered { .. } => "endpoint_registered",
            MeshEvent::EndpointDeregistered { .. } => "endpoint_deregistered",
            MeshEvent::EndpointDegraded { .. } => "endpoint_degraded",
            MeshEvent::EndpointHealthCheckFailed { .. } => "endpoint_health_check_failed",
            MeshEvent::CircuitStateChanged { .. } => "circuit_state_changed",
            MeshEvent::MappingsReplaced { .. } => "mappings_replaced",
        }
    }

    /// The app-id the event concerns, when it concerns one.
    pub fn app_id(&self) -> Option<&str> {
        match self {
            MeshEvent::EndpointRegistered { app_id, .. }
            | MeshEvent::EndpointDeregistered { app_id, .. }
            | MeshEvent::EndpointDegraded { app_id, .. }
            | MeshEvent::EndpointHealthCheckFailed { app_id, .. }
            | MeshEvent::CircuitStateChanged { app_id, .. } => Some(app_id),
            MeshEvent::MappingsReplaced { .. } => None,
        }
    }
}
