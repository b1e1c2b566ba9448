//! Route decisions — from service name or app-id to a concrete endpoint.
//!
//! Selection runs in two filter stages before the balancer picks. First
//! the candidates are narrowed to live endpoints (fresh heartbeat, not
//! unavailable or draining); if that leaves nothing, the full registered
//! set is kept rather than failing the route. Second, endpoints over the
//! load threshold are dropped; again, if every candidate is saturated the
//! previous set is kept. A route is only refused when the app has no
//! registered endpoints at all.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use meshwork_events::{EventBus, MeshEvent};
use meshwork_state::{AppId, Endpoint, MeshStore, StateResult, epoch_ms};

use crate::balancer::{Algorithm, Balancer};
use crate::mapping::MappingTable;

/// Router settings (`[router]` section of the daemon config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub default_algorithm: Algorithm,
    /// Endpoints over this load are dropped when alternatives exist.
    pub load_threshold_percent: u8,
    /// Total endpoints (selected plus alternates) per route decision.
    pub max_top_endpoints: usize,
    /// App-id used when a service name has no mapping.
    pub default_app_id: String,
    /// Cap on per-app balancer state entries.
    pub balancer_state_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_algorithm: Algorithm::RoundRobin,
            load_threshold_percent: 80,
            max_top_endpoints: 3,
            default_app_id: "mesh-default".to_string(),
            balancer_state_capacity: 256,
        }
    }
}

/// Outcome of one route request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub app_id: AppId,
    pub algorithm: Algorithm,
    /// The endpoint the caller should dispatch to.
    pub endpoint: Endpoint,
    /// Runner-up candidates, best first, for caller-side failover.
    pub alternates: Vec<Endpoint>,
}

/// Resolves service names and picks endpoints for app-ids.
pub struct MeshRouter {
    store: MeshStore,
    mappings: MappingTable,
    balancer: Balancer,
    bus: EventBus,
    config: RouterConfig,
    degradation_threshold: Duration,
}

impl MeshRouter {
    pub fn new(
        store: MeshStore,
        bus: EventBus,
        config: RouterConfig,
        degradation_threshold: Duration,
    ) -> Self {
        let mappings = MappingTable::new(config.default_app_id.clone());
        let balancer = Balancer::new(config.balancer_state_capacity);
        Self {
            store,
            mappings,
            balancer,
            bus,
            config,
            degradation_threshold,
        }
    }

    /// App-id owning a service name; the default app-id when unmapped.
    pub fn resolve_app_id(&self, service_name: &str) -> AppId {
        self.mappings.resolve(service_name)
    }

    /// Pick an endpoint for an app-id with the default algorithm.
    pub fn select_endpoint(&self, app_id: &str) -> StateResult<Option<Endpoint>> {
        Ok(self.route_for_app(app_id, None)?.map(|d| d.endpoint))
    }

    /// Full route decision for an app-id, optionally overriding the
    /// configured algorithm for this one request.
    pub fn route_for_app(
        &self,
        app_id: &str,
        algorithm: Option<Algorithm>,
    ) -> StateResult<Option<RouteDecision>> {
        let algorithm = algorithm.unwrap_or(self.config.default_algorithm);
        let registered = self.store.endpoints_for_app(app_id)?;
        let pool = self.routable(app_id, registered);

        let Some(idx) = self.balancer.pick(algorithm, app_id, &pool) else {
            debug!(app_id, "no endpoints to route to");
            return Ok(None);
        };
        let endpoint = pool[idx].clone();

        let mut alternates: Vec<Endpoint> = pool
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, e)| e)
            .collect();
        alternates.sort_by(|a, b| {
            (a.load_percent, a.current_connections, a.instance_id.as_str()).cmp(&(
                b.load_percent,
                b.current_connections,
                b.instance_id.as_str(),
            ))
        });
        alternates.truncate(self.config.max_top_endpoints.max(1) - 1);

        debug!(
            app_id,
            algorithm = algorithm.as_str(),
            endpoint = %endpoint.address(),
            alternates = alternates.len(),
            "route decided"
        );
        Ok(Some(RouteDecision {
            app_id: app_id.to_string(),
            algorithm,
            endpoint,
            alternates,
        }))
    }

    /// Resolve a service name, then route for the owning app-id.
    pub fn route_for_service(
        &self,
        service_name: &str,
        algorithm: Option<Algorithm>,
    ) -> StateResult<Option<RouteDecision>> {
        let app_id = self.mappings.resolve(service_name);
        self.route_for_app(&app_id, algorithm)
    }

    /// Replace the service-name mappings from a snapshot.
    pub fn replace_mappings(&self, snapshot: BTreeMap<String, AppId>) -> (u64, usize) {
        let (version, count) = self.mappings.replace(snapshot);
        self.bus.publish(MeshEvent::MappingsReplaced { version, count });
        (version, count)
    }

    /// Current mapping table contents and version.
    pub fn mapping_snapshot(&self) -> (BTreeMap<String, AppId>, u64) {
        self.mappings.snapshot()
    }

    /// Apply the liveness and load filters with their fallbacks.
    fn routable(&self, app_id: &str, registered: Vec<Endpoint>) -> Vec<Endpoint> {
        if registered.is_empty() {
            return registered;
        }
        let now = epoch_ms();

        let alive: Vec<Endpoint> = registered
            .iter()
            .filter(|e| e.is_alive(self.degradation_threshold, now))
            .cloned()
            .collect();
        let pool = if alive.is_empty() {
            debug!(app_id, "no live endpoints, routing over full registered set");
            registered
        } else {
            alive
        };

        let threshold = self.config.load_threshold_percent;
        let cool: Vec<Endpoint> = pool
            .iter()
            .filter(|e| e.load_percent <= threshold)
            .cloned()
            .collect();
        if cool.is_empty() {
            debug!(app_id, threshold, "every endpoint over the load threshold");
            pool
        } else {
            cool
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_state::EndpointStatus;

    const TTL: Duration = Duration::from_secs(600);

    fn endpoint(instance_id: &str, app_id: &str, load: u8) -> Endpoint {
        Endpoint {
            instance_id: instance_id.to_string(),
            app_id: app_id.to_string(),
            service_names: Vec::new(),
            host: instance_id.to_string(),
            port: 8080,
            status: EndpointStatus::Healthy,
            current_connections: 0,
            max_connections: 500,
            load_percent: load,
            last_heartbeat_at: epoch_ms(),
            issues: Vec::new(),
            registered_at: epoch_ms(),
        }
    }

    fn test_router() -> MeshRouter {
        let store = MeshStore::open_in_memory().unwrap();
        MeshRouter::new(
            store,
            EventBus::default(),
            RouterConfig::default(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn routes_only_to_live_endpoints() {
        let router = test_router();
        let mut draining = endpoint("i-1", "auth", 10);
        draining.status = EndpointStatus::ShuttingDown;
        router.store.put_endpoint(&draining, TTL).unwrap();
        router.store.put_endpoint(&endpoint("i-2", "auth", 10), TTL).unwrap();

        for _ in 0..5 {
            let decision = router.route_for_app("auth", None).unwrap().unwrap();
            assert_eq!(decision.endpoint.instance_id, "i-2");
        }
    }

    #[test]
    fn falls_back_to_registered_set_when_none_alive() {
        let router = test_router();
        let mut stale = endpoint("i-1", "auth", 10);
        stale.last_heartbeat_at = epoch_ms().saturating_sub(120_000);
        router.store.put_endpoint(&stale, TTL).unwrap();

        let decision = router.route_for_app("auth", None).unwrap();
        assert_eq!(decision.unwrap().endpoint.instance_id, "i-1");
    }

    #[test]
    fn load_filter_drops_hot_endpoints() {
        let router = test_router();
        router.store.put_endpoint(&endpoint("i-hot", "auth", 90), TTL).unwrap();
        router.store.put_endpoint(&endpoint("i-cool", "auth", 10), TTL).unwrap();

        for _ in 0..5 {
            let decision = router.route_for_app("auth", None).unwrap().unwrap();
            assert_eq!(decision.endpoint.instance_id, "i-cool");
        }
    }

    #[test]
    fn saturated_pool_still_routes() {
        let router = test_router();
        for id in ["i-1", "i-2", "i-3"] {
            router.store.put_endpoint(&endpoint(id, "auth", 95), TTL).unwrap();
        }

        let decision = router.route_for_app("auth", None).unwrap();
        assert!(decision.is_some(), "saturation must not refuse the route");
    }

    #[test]
    fn no_endpoints_means_no_route() {
        let router = test_router();
        assert!(router.route_for_app("ghost", None).unwrap().is_none());
    }

    #[test]
    fn alternates_are_capped_and_sorted_by_load() {
        let router = test_router();
        router.store.put_endpoint(&endpoint("i-1", "auth", 40), TTL).unwrap();
        router.store.put_endpoint(&endpoint("i-2", "auth", 20), TTL).unwrap();
        router.store.put_endpoint(&endpoint("i-3", "auth", 60), TTL).unwrap();
        router.store.put_endpoint(&endpoint("i-4", "auth", 30), TTL).unwrap();

        let decision = router.route_for_app("auth", None).unwrap().unwrap();
        // Three total: the pick plus two alternates.
        assert_eq!(decision.alternates.len(), 2);
        let loads: Vec<u8> = decision.alternates.iter().map(|e| e.load_percent).collect();
        let mut sorted = loads.clone();
        sorted.sort();
        assert_eq!(loads, sorted);
        assert!(!decision
            .alternates
            .iter()
            .any(|e| e.instance_id == decision.endpoint.instance_id));
    }

    #[test]
    fn algorithm_override_applies_per_request() {
        let router = test_router();
        router.store.put_endpoint(&endpoint("i-1", "auth", 0), TTL).unwrap();

        let decision = router
            .route_for_app("auth", Some(Algorithm::LeastConnections))
            .unwrap()
            .unwrap();
        assert_eq!(decision.algorithm, Algorithm::LeastConnections);
    }

    #[test]
    fn service_names_resolve_through_mappings() {
        let router = test_router();
        router.store.put_endpoint(&endpoint("i-1", "auth", 0), TTL).unwrap();

        let mut snapshot = BTreeMap::new();
        snapshot.insert("login".to_string(), "auth".to_string());
        router.replace_mappings(snapshot);

        let decision = router.route_for_service("login", None).unwrap().unwrap();
        assert_eq!(decision.app_id, "auth");
        // Unmapped names fall through to the default app-id.
        assert_eq!(router.resolve_app_id("unknown"), "mesh-default");
    }

    #[test]
    fn replacing_mappings_publishes_event() {
        let store = MeshStore::open_in_memory().unwrap();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let router = MeshRouter::new(
            store,
            bus,
            RouterConfig::default(),
            Duration::from_secs(60),
        );

        let mut snapshot = BTreeMap::new();
        snapshot.insert("login".to_string(), "auth".to_string());
        router.replace_mappings(snapshot);

        let event = rx.try_recv().unwrap();
        assert_eq!(event, MeshEvent::MappingsReplaced { version: 1, count: 1 });
    }
}
