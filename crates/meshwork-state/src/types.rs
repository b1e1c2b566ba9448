//! Domain types for the meshwork endpoint store.
//!
//! These types represent the persisted state of registered endpoints and
//! per-app circuit breakers. All types are serializable to/from JSON for
//! storage in redb tables and for transit over the external event channel.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Logical deployment identity a caller routes to; the unit of load
/// balancing and circuit breaking.
pub type AppId = String;

/// Unique identifier for one registered endpoint instance.
pub type InstanceId = String;

/// Milliseconds since the unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Endpoint ──────────────────────────────────────────────────────

/// One registered service instance reachable at `host:port`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub instance_id: InstanceId,
    pub app_id: AppId,
    /// Logical service names this instance serves.
    pub service_names: Vec<String>,
    pub host: String,
    pub port: u16,
    /// Status as last reported; reads adjust for missed heartbeats via
    /// [`Endpoint::effective_status`].
    pub status: EndpointStatus,
    pub current_connections: u32,
    /// Connection capacity; 0 means unknown.
    #[serde(default)]
    pub max_connections: u32,
    /// Reported load, 0-100.
    pub load_percent: u8,
    /// Unix timestamp (ms) of the last heartbeat.
    pub last_heartbeat_at: u64,
    /// Free-text diagnostics reported with the last heartbeat; replaced
    /// wholesale, never appended.
    pub issues: Vec<String>,
    /// Unix timestamp (ms) when this instance first registered.
    pub registered_at: u64,
}

impl Endpoint {
    /// Full address string for outbound calls and probes.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Milliseconds since the last heartbeat.
    pub fn heartbeat_age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_heartbeat_at)
    }

    /// Status adjusted for missed heartbeats: an endpoint whose heartbeat
    /// age exceeds the degradation threshold reports Degraded even if its
    /// stored status says Healthy. Stored states that are already worse
    /// (Unavailable, ShuttingDown) win.
    pub fn effective_status(&self, degradation_threshold: Duration, now_ms: u64) -> EndpointStatus {
        match self.status {
            EndpointStatus::Unavailable | EndpointStatus::ShuttingDown => self.status,
            _ if self.heartbeat_age_ms(now_ms) > degradation_threshold.as_millis() as u64 => {
                EndpointStatus::Degraded
            }
            _ => self.status,
        }
    }

    /// Whether this endpoint is considered alive for routing: it has not
    /// reported itself unavailable or shutting down, and its heartbeat age
    /// is within the degradation threshold.
    pub fn is_alive(&self, degradation_threshold: Duration, now_ms: u64) -> bool {
        !matches!(
            self.status,
            EndpointStatus::Unavailable | EndpointStatus::ShuttingDown
        ) && self.heartbeat_age_ms(now_ms) <= degradation_threshold.as_millis() as u64
    }
}

/// Reported health of an endpoint instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Healthy,
    Degraded,
    Unavailable,
    ShuttingDown,
}

impl EndpointStatus {
    /// Stable label used in summaries and metric names.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Healthy => "healthy",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Unavailable => "unavailable",
            EndpointStatus::ShuttingDown => "shutting_down",
        }
    }
}

// ── Circuit breaker ───────────────────────────────────────────────

/// Fault-isolation state for one app-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Sustained failures, calls fail fast.
    Open,
    /// Cooldown elapsed, probe calls allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Durable breaker row for one app-id.
///
/// Mutated only through [`crate::MeshStore::update_breaker`], which applies
/// the change atomically with respect to concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Unix timestamp (ms) of the transition into Open; 0 if never opened.
    pub opened_at: u64,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: 0,
        }
    }
}
