//! Mesh integration tests.
//!
//! Multi-component scenarios: registration flowing into the read views,
//! heartbeat auto-registration, service resolution and routing over live
//! endpoints, circuit breaker lifecycle and cross-process adoption, and
//! lease expiry.
//!
//! Everything runs in-process against in-memory stores — no network, no
//! daemon binary, no clock control beyond the millisecond stamps the
//! store already keeps.

use std::collections::BTreeMap;
use std::time::Duration;

use meshwork_breaker::{BreakerConfig, CircuitBreaker};
use meshwork_events::{DeregisterReason, EventBus, HeartbeatSignal, MeshEvent};
use meshwork_registry::{RegisterRequest, Registry, RegistryConfig};
use meshwork_router::{Algorithm, MeshRouter, RouterConfig};
use meshwork_state::*;

fn test_store() -> MeshStore {
    MeshStore::open_in_memory().unwrap()
}

fn test_registry(store: &MeshStore, bus: &EventBus) -> Registry {
    Registry::new(store.clone(), bus.clone(), RegistryConfig::default())
}

fn test_router(store: &MeshStore, bus: &EventBus) -> MeshRouter {
    MeshRouter::new(
        store.clone(),
        bus.clone(),
        RouterConfig::default(),
        RegistryConfig::default().degradation_threshold(),
    )
}

fn register(registry: &Registry, app_id: &str, instance_id: &str, host: &str, port: u16) {
    registry
        .register(RegisterRequest {
            app_id: app_id.to_string(),
            host: host.to_string(),
            port,
            service_names: Vec::new(),
            instance_id: Some(instance_id.to_string()),
        })
        .unwrap();
}

fn heartbeat_for(app_id: &str, instance_id: &str) -> HeartbeatSignal {
    HeartbeatSignal {
        app_id: app_id.to_string(),
        instance_id: instance_id.to_string(),
        status: None,
        host: None,
        port: None,
        service_names: Vec::new(),
        load_percent: 0,
        current_connections: 0,
        max_connections: None,
        issues: Vec::new(),
    }
}

/// Endpoint whose last heartbeat is `age_ms` in the past. The record
/// itself has a long lease; only the heartbeat is old.
fn stale_endpoint(app_id: &str, instance_id: &str, age_ms: u64) -> Endpoint {
    let now = epoch_ms();
    Endpoint {
        instance_id: instance_id.to_string(),
        app_id: app_id.to_string(),
        service_names: Vec::new(),
        host: instance_id.to_string(),
        port: 8080,
        status: EndpointStatus::Healthy,
        current_connections: 0,
        max_connections: 500,
        load_percent: 0,
        last_heartbeat_at: now.saturating_sub(age_ms),
        issues: Vec::new(),
        registered_at: now.saturating_sub(age_ms),
    }
}

// ── Registration and Read Views ─────────────────────────────────

#[test]
fn register_and_read_back() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);

    register(&registry, "auth-app", "auth-1", "10.0.0.1", 9100);
    register(&registry, "auth-app", "auth-2", "10.0.0.2", 9101);

    let view = registry.get_endpoints("auth-app", None, false).unwrap();
    assert_eq!(view.total_count, 2);
    assert_eq!(view.healthy_count, 2);

    let single = registry.get_endpoint("auth-1").unwrap();
    assert_eq!(single.host, "10.0.0.1");
    assert_eq!(single.port, 9100);
    assert_eq!(single.status, EndpointStatus::Healthy);

    let summaries = registry.list_endpoints(None, None).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].app_id, "auth-app");
    assert_eq!(summaries[0].total, 2);
    assert_eq!(summaries[0].by_status.get("healthy"), Some(&2));
}

#[test]
fn deregister_publishes_graceful_reason() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    register(&registry, "auth-app", "auth-1", "10.0.0.1", 9100);

    let mut rx = bus.subscribe();
    assert!(registry
        .deregister("auth-1", DeregisterReason::Graceful)
        .unwrap());

    match rx.try_recv().unwrap() {
        MeshEvent::EndpointDeregistered {
            instance_id,
            reason,
            ..
        } => {
            assert_eq!(instance_id, "auth-1");
            assert_eq!(reason, DeregisterReason::Graceful);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Second deregister is a no-op, not an error.
    assert!(!registry
        .deregister("auth-1", DeregisterReason::Graceful)
        .unwrap());
}

// ── Heartbeat Lifecycle ─────────────────────────────────────────

#[test]
fn heartbeat_auto_registers_unknown_instance() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let mut rx = bus.subscribe();

    let ack = registry
        .heartbeat(&heartbeat_for("orders-app", "orders-1"))
        .unwrap();
    assert_eq!(ack.next_heartbeat_secs, 30);
    assert_eq!(ack.ttl_secs, 90);

    // Host falls back to the app-id, port and capacity to config defaults.
    let endpoint = registry.get_endpoint("orders-1").unwrap();
    assert_eq!(endpoint.host, "orders-app");
    assert_eq!(endpoint.port, 8080);
    assert_eq!(endpoint.max_connections, 500);
    assert_eq!(endpoint.status, EndpointStatus::Healthy);

    assert!(matches!(
        rx.try_recv().unwrap(),
        MeshEvent::EndpointRegistered { .. }
    ));
}

#[test]
fn heartbeat_refreshes_mutable_fields() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    register(&registry, "orders-app", "orders-1", "10.0.0.1", 9100);

    let mut signal = heartbeat_for("orders-app", "orders-1");
    signal.load_percent = 45;
    signal.current_connections = 12;
    signal.max_connections = Some(64);
    signal.issues = vec!["gc pause".to_string()];
    registry.heartbeat(&signal).unwrap();

    let endpoint = registry.get_endpoint("orders-1").unwrap();
    assert_eq!(endpoint.load_percent, 45);
    assert_eq!(endpoint.current_connections, 12);
    assert_eq!(endpoint.max_connections, 64);
    assert_eq!(endpoint.issues, vec!["gc pause".to_string()]);
    // Identity fields survive the refresh.
    assert_eq!(endpoint.host, "10.0.0.1");

    // Issues are a snapshot: a clean heartbeat clears them.
    registry
        .heartbeat(&heartbeat_for("orders-app", "orders-1"))
        .unwrap();
    assert!(registry.get_endpoint("orders-1").unwrap().issues.is_empty());
}

#[test]
fn stale_heartbeat_reads_degraded() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);

    // Two minutes without a heartbeat, against a 60s threshold.
    store
        .put_endpoint(
            &stale_endpoint("orders-app", "orders-1", 120_000),
            Duration::from_secs(600),
        )
        .unwrap();

    let endpoint = registry.get_endpoint("orders-1").unwrap();
    assert_eq!(endpoint.status, EndpointStatus::Degraded);

    let view = registry.get_endpoints("orders-app", None, false).unwrap();
    assert_eq!(view.total_count, 1);
    assert_eq!(view.healthy_count, 0);
}

// ── Service Resolution and Routing ──────────────────────────────

#[test]
fn route_through_mapping_table() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let router = test_router(&store, &bus);

    let mut mappings = BTreeMap::new();
    mappings.insert("billing".to_string(), "billing-app".to_string());
    let (version, count) = router.replace_mappings(mappings);
    assert_eq!(version, 1);
    assert_eq!(count, 1);

    register(&registry, "billing-app", "bill-1", "10.0.0.1", 9100);
    register(&registry, "billing-app", "bill-2", "10.0.0.2", 9101);

    let decision = router.route_for_service("billing", None).unwrap().unwrap();
    assert_eq!(decision.app_id, "billing-app");
    assert!(decision.endpoint.instance_id.starts_with("bill-"));

    // Unmapped names fall through to the default app-id, which has no
    // endpoints here, so the route comes back empty.
    assert_eq!(router.resolve_app_id("unknown-svc"), "mesh-default");
    assert!(router.route_for_service("unknown-svc", None).unwrap().is_none());
}

#[test]
fn round_robin_cycles_endpoints() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let router = test_router(&store, &bus);

    register(&registry, "search-app", "search-a", "10.0.0.1", 9200);
    register(&registry, "search-app", "search-b", "10.0.0.2", 9200);
    register(&registry, "search-app", "search-c", "10.0.0.3", 9200);

    let picks: Vec<String> = (0..6)
        .map(|_| {
            router
                .route_for_app("search-app", Some(Algorithm::RoundRobin))
                .unwrap()
                .unwrap()
                .endpoint
                .instance_id
        })
        .collect();

    // One full cycle covers every instance, then the order repeats.
    let first_cycle: std::collections::BTreeSet<&String> = picks[..3].iter().collect();
    assert_eq!(first_cycle.len(), 3);
    assert_eq!(picks[..3], picks[3..]);
}

#[test]
fn saturated_pool_still_routes() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let router = test_router(&store, &bus);

    let mut busy = heartbeat_for("search-app", "search-1");
    busy.host = Some("10.0.1.1".to_string());
    busy.port = Some(9200);
    busy.load_percent = 95;
    busy.current_connections = 40;
    registry.heartbeat(&busy).unwrap();

    let mut busier = heartbeat_for("search-app", "search-2");
    busier.host = Some("10.0.1.2".to_string());
    busier.port = Some(9200);
    busier.load_percent = 97;
    busier.current_connections = 10;
    registry.heartbeat(&busier).unwrap();

    // Everyone is over the 80% threshold; the filter falls back to the
    // full pool instead of refusing the route.
    let decision = router
        .route_for_app("search-app", Some(Algorithm::LeastConnections))
        .unwrap()
        .unwrap();
    assert_eq!(decision.endpoint.instance_id, "search-2");

    assert!(router.route_for_app("search-app", None).unwrap().is_some());
}

#[test]
fn stale_endpoint_excluded_while_fresh_exists() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let router = test_router(&store, &bus);

    store
        .put_endpoint(
            &stale_endpoint("search-app", "search-old", 120_000),
            Duration::from_secs(600),
        )
        .unwrap();
    register(&registry, "search-app", "search-new", "10.0.0.2", 9200);

    for _ in 0..4 {
        let decision = router.route_for_app("search-app", None).unwrap().unwrap();
        assert_eq!(decision.endpoint.instance_id, "search-new");
    }

    // With the fresh instance gone the stale one is all that is left,
    // and the liveness filter falls back rather than refusing.
    registry
        .deregister("search-new", DeregisterReason::Graceful)
        .unwrap();
    let decision = router.route_for_app("search-app", None).unwrap().unwrap();
    assert_eq!(decision.endpoint.instance_id, "search-old");
}

// ── Circuit Breaker Lifecycle ───────────────────────────────────

#[test]
fn breaker_opens_at_threshold() {
    let store = test_store();
    let bus = EventBus::default();
    let breaker = CircuitBreaker::new(store, bus, BreakerConfig::default());

    for _ in 0..4 {
        breaker.record_failure("pay-app").unwrap();
    }
    assert_eq!(breaker.state("pay-app").unwrap().state, CircuitState::Closed);
    assert!(breaker.is_call_allowed("pay-app").unwrap());

    let record = breaker.record_failure("pay-app").unwrap();
    assert_eq!(record.state, CircuitState::Open);
    assert_eq!(record.consecutive_failures, 5);
    assert!(!breaker.is_call_allowed("pay-app").unwrap());

    // A success while open resets the count but does not close the
    // circuit; recovery only runs through the half-open probe.
    breaker.record_success("pay-app").unwrap();
    let record = breaker.state("pay-app").unwrap();
    assert_eq!(record.state, CircuitState::Open);
    assert_eq!(record.consecutive_failures, 0);
    assert!(!breaker.is_call_allowed("pay-app").unwrap());
}

#[test]
fn breaker_half_open_probe_closes_or_reopens() {
    let store = test_store();
    let bus = EventBus::default();
    let config = BreakerConfig {
        enabled: true,
        failure_threshold: 2,
        reset_secs: 0,
    };
    let breaker = CircuitBreaker::new(store, bus, config);

    breaker.record_failure("pay-app").unwrap();
    let record = breaker.record_failure("pay-app").unwrap();
    assert_eq!(record.state, CircuitState::Open);

    // Zero cooldown: the next allow check admits a probe via half-open.
    assert!(breaker.is_call_allowed("pay-app").unwrap());
    assert_eq!(
        breaker.state("pay-app").unwrap().state,
        CircuitState::HalfOpen
    );

    breaker.record_success("pay-app").unwrap();
    let record = breaker.state("pay-app").unwrap();
    assert_eq!(record.state, CircuitState::Closed);
    assert_eq!(record.consecutive_failures, 0);

    // Trip again; a failed probe snaps straight back to open.
    breaker.record_failure("pay-app").unwrap();
    breaker.record_failure("pay-app").unwrap();
    assert!(breaker.is_call_allowed("pay-app").unwrap());
    let record = breaker.record_failure("pay-app").unwrap();
    assert_eq!(record.state, CircuitState::Open);
}

#[test]
fn breaker_adopts_remote_state() {
    // Two stores stand in for two mesh processes.
    let local = CircuitBreaker::new(
        test_store(),
        EventBus::default(),
        BreakerConfig {
            enabled: true,
            failure_threshold: 1,
            reset_secs: 30,
        },
    );
    let remote_bus = EventBus::default();
    let remote = CircuitBreaker::new(
        test_store(),
        remote_bus.clone(),
        BreakerConfig::default(),
    );

    local.record_failure("pay-app").unwrap();
    let rows = local.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, CircuitState::Open);

    let mut rx = remote_bus.subscribe();
    remote
        .apply_remote(
            &rows[0].app_id,
            BreakerRecord {
                state: rows[0].state,
                consecutive_failures: rows[0].consecutive_failures,
                opened_at: rows[0].opened_at,
            },
        )
        .unwrap();

    // The adopting process gates calls like the sender, without
    // re-announcing the transition.
    assert!(!remote.is_call_allowed("pay-app").unwrap());
    assert_eq!(remote.state("pay-app").unwrap().state, CircuitState::Open);
    assert!(rx.try_recv().is_err());
}

#[test]
fn breaker_transitions_fan_out_events() {
    let store = test_store();
    let bus = EventBus::default();
    let config = BreakerConfig {
        enabled: true,
        failure_threshold: 1,
        reset_secs: 0,
    };
    let breaker = CircuitBreaker::new(store, bus.clone(), config);
    let mut rx = bus.subscribe();

    breaker.record_failure("pay-app").unwrap();
    assert!(matches!(
        rx.try_recv().unwrap(),
        MeshEvent::CircuitStateChanged {
            state: CircuitState::Open,
            consecutive_failures: 1,
            ..
        }
    ));

    assert!(breaker.is_call_allowed("pay-app").unwrap());
    assert!(matches!(
        rx.try_recv().unwrap(),
        MeshEvent::CircuitStateChanged {
            state: CircuitState::HalfOpen,
            ..
        }
    ));

    breaker.record_success("pay-app").unwrap();
    assert!(matches!(
        rx.try_recv().unwrap(),
        MeshEvent::CircuitStateChanged {
            state: CircuitState::Closed,
            ..
        }
    ));
}

// ── Lease Expiry ────────────────────────────────────────────────

#[test]
fn expired_lease_disappears_without_events() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let mut rx = bus.subscribe();

    store
        .put_endpoint(
            &stale_endpoint("orders-app", "orders-1", 0),
            Duration::ZERO,
        )
        .unwrap();

    assert!(matches!(
        registry.get_endpoint("orders-1"),
        Err(StateError::NotFound(_))
    ));
    assert_eq!(registry.purge_expired().unwrap(), 1);

    // Expiry is passive: no deregistration event for the reaped lease.
    assert!(rx.try_recv().is_err());
}

// ── End-to-End: Register, Map, Route, Trip, Recover ─────────────

#[test]
fn e2e_register_map_route_trip_recover() {
    let store = test_store();
    let bus = EventBus::default();
    let registry = test_registry(&store, &bus);
    let router = test_router(&store, &bus);
    let breaker = CircuitBreaker::new(
        store.clone(),
        bus.clone(),
        BreakerConfig {
            enabled: true,
            failure_threshold: 3,
            reset_secs: 0,
        },
    );

    // 1. Two instances of payments-app announce themselves by heartbeat.
    for (instance_id, host) in [("pay-1", "10.0.2.1"), ("pay-2", "10.0.2.2")] {
        let mut signal = heartbeat_for("payments-app", instance_id);
        signal.host = Some(host.to_string());
        signal.port = Some(9300);
        registry.heartbeat(&signal).unwrap();
    }
    let view = registry.get_endpoints("payments-app", None, true).unwrap();
    assert_eq!(view.endpoints.len(), 2);

    // 2. Map the logical service name onto the app.
    let mut mappings = BTreeMap::new();
    mappings.insert("payments".to_string(), "payments-app".to_string());
    router.replace_mappings(mappings);

    // 3. Routing resolves the name and offers a failover alternate.
    let decision = router.route_for_service("payments", None).unwrap().unwrap();
    assert_eq!(decision.app_id, "payments-app");
    assert_eq!(decision.alternates.len(), 1);
    assert_ne!(
        decision.endpoint.instance_id,
        decision.alternates[0].instance_id
    );

    // 4. Three failed calls trip the breaker.
    for _ in 0..3 {
        breaker.record_failure("payments-app").unwrap();
    }
    assert_eq!(
        breaker.state("payments-app").unwrap().state,
        CircuitState::Open
    );

    // 5. Zero cooldown, so the next check admits a probe; its success
    //    closes the circuit.
    assert!(breaker.is_call_allowed("payments-app").unwrap());
    breaker.record_success("payments-app").unwrap();
    assert_eq!(
        breaker.state("payments-app").unwrap().state,
        CircuitState::Closed
    );

    // 6. Both instances drain away; the route is gone with them.
    for instance_id in ["pay-1", "pay-2"] {
        registry
            .deregister(instance_id, DeregisterReason::Graceful)
            .unwrap();
    }
    assert!(router.route_for_service("payments", None).unwrap().is_none());
}
