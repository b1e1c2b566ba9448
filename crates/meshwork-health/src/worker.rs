//! Background sweep over all registered endpoints.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use meshwork_events::{DegradeReason, DeregisterReason, EventBus, MeshEvent};
use meshwork_registry::Registry;
use meshwork_state::{Endpoint, InstanceId, MeshStore, StateResult, epoch_ms};

use crate::prober::{ProbeResult, ProbeTracker, http_probe};

/// Health worker settings (`[health_check]` section of the daemon config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Per-probe timeout, independent of the invocation client's timeouts.
    pub timeout_ms: u64,
    /// Consecutive failures before deregistration; 0 keeps probing but
    /// never deregisters.
    pub failure_threshold: u32,
    /// Delay before the first sweep, so just-started instances get a
    /// chance to come up.
    pub startup_delay_secs: u64,
    /// Path probed on each endpoint.
    pub probe_path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_ms: 2000,
            failure_threshold: 3,
            startup_delay_secs: 10,
            probe_path: "/healthz".to_string(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

/// Probes every registered endpoint and deregisters instances that keep
/// failing. Also reports heartbeat staleness, once per transition.
pub struct HealthWorker {
    store: MeshStore,
    registry: Registry,
    bus: EventBus,
    config: HealthCheckConfig,
}

impl HealthWorker {
    pub fn new(
        store: MeshStore,
        registry: Registry,
        bus: EventBus,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            config,
        }
    }

    /// Run the worker on a background task until the shutdown signal.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("health checks disabled");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.config.startup_delay()) => {}
            _ = shutdown.changed() => return,
        }

        info!(
            interval_secs = self.config.interval_secs,
            failure_threshold = self.config.failure_threshold,
            path = %self.config.probe_path,
            "health worker started"
        );
        let mut tracker = ProbeTracker::default();
        loop {
            if let Err(e) = self.sweep(&mut tracker).await {
                error!(error = %e, "health sweep failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = shutdown.changed() => {
                    debug!("health worker shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over every registered endpoint.
    async fn sweep(&self, tracker: &mut ProbeTracker) -> StateResult<()> {
        let endpoints = self.store.all_endpoints()?;
        let known: HashSet<InstanceId> =
            endpoints.iter().map(|e| e.instance_id.clone()).collect();
        tracker.retain_known(&known);

        let now = epoch_ms();
        let threshold = self.registry.config().degradation_threshold();
        for endpoint in endpoints {
            self.note_staleness(tracker, &endpoint, threshold, now);
            let result = http_probe(
                &endpoint.address(),
                &self.config.probe_path,
                self.config.timeout(),
            )
            .await;
            self.apply_probe(tracker, &endpoint, result)?;
        }
        Ok(())
    }

    /// Report an endpoint whose heartbeat has gone stale. The flag clears
    /// when a fresh heartbeat arrives, so each lapse is reported once.
    fn note_staleness(
        &self,
        tracker: &mut ProbeTracker,
        endpoint: &Endpoint,
        threshold: Duration,
        now: u64,
    ) {
        if endpoint.heartbeat_age_ms(now) <= threshold.as_millis() as u64 {
            tracker.clear_stale(&endpoint.instance_id);
            return;
        }
        if tracker.flag_stale(&endpoint.instance_id) {
            warn!(
                app_id = %endpoint.app_id,
                instance_id = %endpoint.instance_id,
                "endpoint heartbeat went stale"
            );
            self.bus.publish(MeshEvent::EndpointDegraded {
                app_id: endpoint.app_id.clone(),
                instance_id: endpoint.instance_id.clone(),
                reason: DegradeReason::MissedHeartbeat,
            });
        }
    }

    fn apply_probe(
        &self,
        tracker: &mut ProbeTracker,
        endpoint: &Endpoint,
        result: ProbeResult,
    ) -> StateResult<()> {
        if result == ProbeResult::Healthy {
            tracker.record(&endpoint.instance_id, result);
            return Ok(());
        }

        let failures = tracker.record(&endpoint.instance_id, result);
        warn!(
            app_id = %endpoint.app_id,
            instance_id = %endpoint.instance_id,
            failures,
            ?result,
            "health probe failed"
        );
        self.bus.publish(MeshEvent::EndpointHealthCheckFailed {
            app_id: endpoint.app_id.clone(),
            instance_id: endpoint.instance_id.clone(),
            consecutive_failures: failures,
        });

        if self.config.failure_threshold > 0 && failures >= self.config.failure_threshold {
            self.registry
                .deregister(&endpoint.instance_id, DeregisterReason::HealthCheckFailed)?;
            // The same id can re-register before the next sweep prunes;
            // it gets a full threshold again, not the stale count.
            tracker.forget(&endpoint.instance_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_registry::{RegisterRequest, RegistryConfig};
    use tokio::sync::broadcast;

    fn fixtures() -> (MeshStore, Registry, EventBus) {
        let store = MeshStore::open_in_memory().unwrap();
        let bus = EventBus::default();
        let registry = Registry::new(store.clone(), bus.clone(), RegistryConfig::default());
        (store, registry, bus)
    }

    /// Registers an endpoint nothing listens on: probes get refused.
    fn register_unreachable(registry: &Registry, instance_id: &str) {
        registry
            .register(RegisterRequest {
                app_id: "auth".to_string(),
                host: "127.0.0.1".to_string(),
                port: 1,
                service_names: Vec::new(),
                instance_id: Some(instance_id.to_string()),
            })
            .unwrap();
    }

    fn quick_config(failure_threshold: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            failure_threshold,
            timeout_ms: 500,
            ..HealthCheckConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn failing_endpoint_deregisters_at_threshold() {
        let (store, registry, bus) = fixtures();
        register_unreachable(&registry, "i-1");
        let worker = HealthWorker::new(store.clone(), registry, bus.clone(), quick_config(2));

        let mut rx = bus.subscribe();
        let mut tracker = ProbeTracker::default();

        worker.sweep(&mut tracker).await.unwrap();
        let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["endpoint_health_check_failed"]);
        assert!(store.get_endpoint("i-1").unwrap().is_some());

        worker.sweep(&mut tracker).await.unwrap();
        let events = drain(&mut rx);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["endpoint_health_check_failed", "endpoint_deregistered"]
        );
        assert!(matches!(
            events[1],
            MeshEvent::EndpointDeregistered {
                reason: DeregisterReason::HealthCheckFailed,
                ..
            }
        ));
        assert!(store.get_endpoint("i-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_threshold_probes_without_deregistering() {
        let (store, registry, bus) = fixtures();
        register_unreachable(&registry, "i-1");
        let worker = HealthWorker::new(store.clone(), registry, bus.clone(), quick_config(0));

        let mut rx = bus.subscribe();
        let mut tracker = ProbeTracker::default();
        for _ in 0..3 {
            worker.sweep(&mut tracker).await.unwrap();
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| e.kind() == "endpoint_health_check_failed"));
        assert!(store.get_endpoint("i-1").unwrap().is_some());
        assert_eq!(tracker.failures("i-1"), 3);
    }

    #[tokio::test]
    async fn stale_heartbeat_reported_once() {
        let (store, registry, bus) = fixtures();
        register_unreachable(&registry, "i-1");

        // Rewind the heartbeat past the degradation threshold.
        let mut endpoint = store.get_endpoint("i-1").unwrap().unwrap();
        endpoint.last_heartbeat_at = epoch_ms().saturating_sub(120_000);
        store
            .put_endpoint(&endpoint, Duration::from_secs(600))
            .unwrap();

        let worker = HealthWorker::new(store, registry, bus.clone(), quick_config(0));
        let mut rx = bus.subscribe();
        let mut tracker = ProbeTracker::default();
        worker.sweep(&mut tracker).await.unwrap();
        worker.sweep(&mut tracker).await.unwrap();

        let degraded = drain(&mut rx)
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    MeshEvent::EndpointDegraded {
                        reason: DegradeReason::MissedHeartbeat,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(degraded, 1);
    }

    #[tokio::test]
    async fn counters_drop_when_instance_vanishes() {
        let (store, registry, bus) = fixtures();
        register_unreachable(&registry, "i-1");
        let worker =
            HealthWorker::new(store, registry.clone(), bus.clone(), quick_config(5));

        let mut tracker = ProbeTracker::default();
        worker.sweep(&mut tracker).await.unwrap();
        assert_eq!(tracker.failures("i-1"), 1);

        registry
            .deregister("i-1", DeregisterReason::Graceful)
            .unwrap();
        worker.sweep(&mut tracker).await.unwrap();
        assert_eq!(tracker.failures("i-1"), 0);
    }

    #[tokio::test]
    async fn reregistered_instance_gets_a_fresh_threshold() {
        let (store, registry, bus) = fixtures();
        register_unreachable(&registry, "i-1");
        let worker =
            HealthWorker::new(store.clone(), registry.clone(), bus, quick_config(2));

        let mut tracker = ProbeTracker::default();
        worker.sweep(&mut tracker).await.unwrap();
        worker.sweep(&mut tracker).await.unwrap();
        assert!(store.get_endpoint("i-1").unwrap().is_none());
        assert_eq!(tracker.failures("i-1"), 0);

        // The same id comes back before the next sweep. One failed probe
        // must not be enough to deregister it again.
        register_unreachable(&registry, "i-1");
        worker.sweep(&mut tracker).await.unwrap();
        assert_eq!(tracker.failures("i-1"), 1);
        assert!(store.get_endpoint("i-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn worker_exits_on_shutdown() {
        let (store, registry, bus) = fixtures();
        let config = HealthCheckConfig {
            startup_delay_secs: 60,
            ..HealthCheckConfig::default()
        };
        let worker = HealthWorker::new(store, registry, bus, config);

        let (tx, rx) = watch::channel(false);
        let handle = worker.spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
