//! Endpoint registration and liveness tracking.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use meshwork_events::{DegradeReason, DeregisterReason, EventBus, HeartbeatSignal, MeshEvent};
use meshwork_state::{
    AppId, Endpoint, EndpointStatus, InstanceId, MeshStore, StateError, StateResult, epoch_ms,
};

/// Reported load at or above which a heartbeat marks the instance as
/// running hot, independent of the router's own load filter.
const HIGH_LOAD_PERCENT: u8 = 90;

/// Registry settings (`[registry]` section of the daemon config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Endpoint record lease; a record with no heartbeat for this long
    /// expires and disappears from every read.
    pub endpoint_ttl_secs: u64,
    /// Cadence instances are told to heartbeat at.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which an endpoint reads as Degraded.
    pub degradation_threshold_secs: u64,
    /// Port assumed when a liveness signal does not carry one.
    pub default_port: u16,
    /// Connection capacity assumed when a signal does not carry one.
    pub max_connections: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint_ttl_secs: 90,
            heartbeat_interval_secs: 30,
            degradation_threshold_secs: 60,
            default_port: 8080,
            max_connections: 500,
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.endpoint_ttl_secs)
    }

    pub fn degradation_threshold(&self) -> Duration {
        Duration::from_secs(self.degradation_threshold_secs)
    }
}

/// Explicit registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub app_id: AppId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub service_names: Vec<String>,
    /// Re-registering an existing id overwrites; absent ids are generated.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
}

/// Heartbeat acknowledgement: when to beat next and how long the lease
/// holds without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub next_heartbeat_secs: u64,
    pub ttl_secs: u64,
}

/// Endpoint listing for one app-id with health tallies.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointsView {
    pub endpoints: Vec<Endpoint>,
    pub healthy_count: usize,
    pub total_count: usize,
}

/// Administrative per-app rollup of endpoint counts by status.
#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
    pub app_id: AppId,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// Endpoint registration, heartbeats, and health views over the store.
#[derive(Clone)]
pub struct Registry {
    store: MeshStore,
    bus: EventBus,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: MeshStore, bus: EventBus, config: RegistryConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an endpoint, generating an instance id when none is given.
    pub fn register(&self, request: RegisterRequest) -> StateResult<InstanceId> {
        let instance_id = request
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = epoch_ms();
        // An overwrite keeps the original registration time.
        let registered_at = self
            .store
            .get_endpoint(&instance_id)?
            .map(|e| e.registered_at)
            .unwrap_or(now);

        let endpoint = Endpoint {
            instance_id: instance_id.clone(),
            app_id: request.app_id.clone(),
            service_names: request.service_names,
            host: request.host,
            port: request.port,
            status: EndpointStatus::Healthy,
            current_connections: 0,
            max_connections: self.config.max_connections,
            load_percent: 0,
            last_heartbeat_at: now,
            issues: Vec::new(),
            registered_at,
        };
        self.store.put_endpoint(&endpoint, self.config.ttl())?;

        info!(
            app_id = %request.app_id,
            instance_id = %instance_id,
            address = %endpoint.address(),
            "endpoint registered"
        );
        self.bus.publish(MeshEvent::EndpointRegistered {
            app_id: request.app_id,
            instance_id: instance_id.clone(),
        });
        Ok(instance_id)
    }

    /// Remove an endpoint. Returns false when the id is unknown.
    pub fn deregister(&self, instance_id: &str, reason: DeregisterReason) -> StateResult<bool> {
        match self.store.remove_endpoint(instance_id)? {
            Some(endpoint) => {
                info!(
                    app_id = %endpoint.app_id,
                    instance_id,
                    ?reason,
                    "endpoint deregistered"
                );
                self.bus.publish(MeshEvent::EndpointDeregistered {
                    app_id: endpoint.app_id,
                    instance_id: instance_id.to_string(),
                    reason,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ingest a heartbeat: refresh the lease and the mutable fields, or
    /// auto-register an instance the mesh has never seen, filling host
    /// and port from the signal with config defaults for the gaps.
    pub fn heartbeat(&self, signal: &HeartbeatSignal) -> StateResult<HeartbeatAck> {
        let now = epoch_ms();
        let previous = self.store.get_endpoint(&signal.instance_id)?;
        let known = previous.is_some();

        let mut endpoint = match previous.clone() {
            Some(existing) => existing,
            None => Endpoint {
                instance_id: signal.instance_id.clone(),
                app_id: signal.app_id.clone(),
                service_names: signal.service_names.clone(),
                host: signal
                    .host
                    .clone()
                    .unwrap_or_else(|| signal.app_id.clone()),
                port: signal.port.unwrap_or(self.config.default_port),
                status: EndpointStatus::Healthy,
                current_connections: 0,
                max_connections: signal.max_connections.unwrap_or(self.config.max_connections),
                load_percent: 0,
                last_heartbeat_at: now,
                issues: Vec::new(),
                registered_at: now,
            },
        };

        if let Some(status) = signal.status {
            endpoint.status = status;
        }
        endpoint.load_percent = signal.load_percent;
        endpoint.current_connections = signal.current_connections;
        if let Some(capacity) = signal.max_connections {
            endpoint.max_connections = capacity;
        }
        // Issues replace the stored set; they are a snapshot, not a log.
        endpoint.issues = signal.issues.clone();
        endpoint.last_heartbeat_at = now;

        self.store.put_endpoint(&endpoint, self.config.ttl())?;

        if known {
            debug!(instance_id = %signal.instance_id, "heartbeat refreshed lease");
        } else {
            info!(
                app_id = %endpoint.app_id,
                instance_id = %endpoint.instance_id,
                address = %endpoint.address(),
                "auto-registered endpoint from heartbeat"
            );
            self.bus.publish(MeshEvent::EndpointRegistered {
                app_id: endpoint.app_id.clone(),
                instance_id: endpoint.instance_id.clone(),
            });
        }
        self.report_overload(previous.as_ref(), &endpoint);

        Ok(HeartbeatAck {
            next_heartbeat_secs: self.config.heartbeat_interval_secs,
            ttl_secs: self.config.endpoint_ttl_secs,
        })
    }

    /// Endpoints for an app-id with read-time health applied.
    ///
    /// `total_count` and `healthy_count` describe the set after the
    /// service-name filter but before the healthy-only filter, so callers
    /// can see how much the health filter hid.
    pub fn get_endpoints(
        &self,
        app_id: &str,
        service_name: Option<&str>,
        healthy_only: bool,
    ) -> StateResult<EndpointsView> {
        let now = epoch_ms();
        let threshold = self.config.degradation_threshold();
        let mut endpoints: Vec<Endpoint> = self
            .store
            .endpoints_for_app(app_id)?
            .into_iter()
            .map(|mut e| {
                e.status = e.effective_status(threshold, now);
                e
            })
            .collect();

        if let Some(name) = service_name {
            endpoints.retain(|e| e.service_names.iter().any(|s| s == name));
        }
        let total_count = endpoints.len();
        let healthy_count = endpoints
            .iter()
            .filter(|e| e.status == EndpointStatus::Healthy)
            .count();
        if healthy_only {
            endpoints.retain(|e| e.status == EndpointStatus::Healthy);
        }

        Ok(EndpointsView {
            endpoints,
            healthy_count,
            total_count,
        })
    }

    /// Single endpoint lookup with read-time health applied.
    pub fn get_endpoint(&self, instance_id: &str) -> StateResult<Endpoint> {
        match self.store.get_endpoint(instance_id)? {
            Some(mut endpoint) => {
                endpoint.status =
                    endpoint.effective_status(self.config.degradation_threshold(), epoch_ms());
                Ok(endpoint)
            }
            None => Err(StateError::NotFound(format!("endpoint {instance_id}"))),
        }
    }

    /// Administrative rollup across all apps, optionally narrowed by an
    /// app-id prefix and a status. The status filter runs after the store
    /// read; the store has no status index.
    pub fn list_endpoints(
        &self,
        prefix: Option<&str>,
        status_filter: Option<EndpointStatus>,
    ) -> StateResult<Vec<AppSummary>> {
        let now = epoch_ms();
        let threshold = self.config.degradation_threshold();
        let mut groups: BTreeMap<AppId, AppSummary> = BTreeMap::new();

        for mut endpoint in self.store.all_endpoints()? {
            if let Some(prefix) = prefix {
                if !endpoint.app_id.starts_with(prefix) {
                    continue;
                }
            }
            endpoint.status = endpoint.effective_status(threshold, now);
            if let Some(wanted) = status_filter {
                if endpoint.status != wanted {
                    continue;
                }
            }
            let group = groups
                .entry(endpoint.app_id.clone())
                .or_insert_with(|| AppSummary {
                    app_id: endpoint.app_id.clone(),
                    total: 0,
                    by_status: BTreeMap::new(),
                });
            group.total += 1;
            *group
                .by_status
                .entry(endpoint.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        Ok(groups.into_values().collect())
    }

    /// Sweep expired records out of the store. Returns how many were
    /// removed; expiry is passive and publishes no deregistration events.
    pub fn purge_expired(&self) -> StateResult<u32> {
        self.store.purge_expired()
    }

    /// Announce a transition into an overloaded condition. Repeated
    /// heartbeats while already overloaded stay quiet.
    fn report_overload(&self, previous: Option<&Endpoint>, current: &Endpoint) {
        let Some(reason) = overload_reason(current) else {
            return;
        };
        if previous.and_then(overload_reason).is_some() {
            return;
        }
        warn!(
            app_id = %current.app_id,
            instance_id = %current.instance_id,
            load = current.load_percent,
            connections = current.current_connections,
            ?reason,
            "endpoint degraded"
        );
        self.bus.publish(MeshEvent::EndpointDegraded {
            app_id: current.app_id.clone(),
            instance_id: current.instance_id.clone(),
            reason,
        });
    }
}

/// Overload condition reported by an endpoint's own heartbeat, if any.
/// Connection saturation wins over plain high load.
fn overload_reason(endpoint: &Endpoint) -> Option<DegradeReason> {
    if endpoint.max_connections > 0 && endpoint.current_connections >= endpoint.max_connections {
        Some(DegradeReason::HighConnections)
    } else if endpoint.load_percent >= HIGH_LOAD_PERCENT {
        Some(DegradeReason::HighLoad)
    } else {
        None
    }
}
