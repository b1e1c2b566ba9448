//! Circuit breaker state machine.
//!
//! A circuit is Closed while calls succeed. Each failure increments a
//! consecutive-failure count; reaching the threshold opens the circuit
//! and calls fail fast. After the reset cooldown the next allow check
//! moves the circuit to HalfOpen, where probe calls flow again: one
//! success closes the circuit, one failure reopens it and restarts the
//! cooldown. All transitions happen inside a single store transaction,
//! so two processes reporting failures concurrently never lose counts.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use meshwork_events::{EventBus, MeshEvent};
use meshwork_state::{AppId, BreakerRecord, CircuitState, MeshStore, StateResult, epoch_ms};

/// Breaker settings (`[breaker]` section of the daemon config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits probe calls.
    pub reset_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_secs: 30,
        }
    }
}

/// One app's breaker state as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub app_id: AppId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: u64,
}

/// Per-app circuit breaker over the shared endpoint store.
pub struct CircuitBreaker {
    store: MeshStore,
    bus: EventBus,
    config: BreakerConfig,
    /// In-memory view of rows this process has touched; read-through on
    /// miss, refreshed on every local transition and remote signal.
    mirror: RwLock<HashMap<AppId, BreakerRecord>>,
}

impl CircuitBreaker {
    pub fn new(store: MeshStore, bus: EventBus, config: BreakerConfig) -> Self {
        Self {
            store,
            bus,
            config,
            mirror: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a call to the app may proceed right now.
    ///
    /// Closed and HalfOpen admit calls. Open refuses them until the reset
    /// cooldown has elapsed, at which point the circuit is atomically
    /// moved to HalfOpen and the call is admitted as a probe.
    pub fn is_call_allowed(&self, app_id: &str) -> StateResult<bool> {
        if !self.config.enabled {
            return Ok(true);
        }
        let record = self.current(app_id)?;
        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(true),
            CircuitState::Open => {
                let reset_ms = self.config.reset_secs * 1000;
                if epoch_ms() < record.opened_at.saturating_add(reset_ms) {
                    return Ok(false);
                }
                // Cooldown over: transition Open -> HalfOpen against the
                // store, tolerating a concurrent transition by someone else.
                let (old, new) = self.store.update_breaker(app_id, |mut r| {
                    if r.state == CircuitState::Open
                        && epoch_ms() >= r.opened_at.saturating_add(reset_ms)
                    {
                        r.state = CircuitState::HalfOpen;
                    }
                    r
                })?;
                self.finish_transition(app_id, old, new);
                Ok(new.state != CircuitState::Open)
            }
        }
    }

    /// Report a successful call: failures reset, and a half-open circuit
    /// closes. An open circuit stays open; it only recovers through the
    /// half-open probe path.
    pub fn record_success(&self, app_id: &str) -> StateResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let (old, new) = self.store.update_breaker(app_id, |mut r| {
            r.consecutive_failures = 0;
            if r.state == CircuitState::HalfOpen {
                r.state = CircuitState::Closed;
            }
            r
        })?;
        self.finish_transition(app_id, old, new);
        Ok(())
    }

    /// Report a failed call: the count rises, and the circuit opens when
    /// the threshold is reached or when a half-open probe fails.
    pub fn record_failure(&self, app_id: &str) -> StateResult<BreakerRecord> {
        if !self.config.enabled {
            return self.store.breaker_record(app_id);
        }
        let threshold = self.config.failure_threshold;
        let (old, new) = self.store.update_breaker(app_id, |mut r| {
            r.consecutive_failures = r.consecutive_failures.saturating_add(1);
            let trips = match r.state {
                CircuitState::Closed => r.consecutive_failures >= threshold,
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if trips {
                r.state = CircuitState::Open;
                r.opened_at = epoch_ms();
            }
            r
        })?;
        self.finish_transition(app_id, old, new);
        Ok(new)
    }

    /// Durable breaker row for an app-id, refreshing the mirror.
    pub fn state(&self, app_id: &str) -> StateResult<BreakerRecord> {
        let record = self.store.breaker_record(app_id)?;
        self.remember(app_id, record);
        Ok(record)
    }

    /// Apply a breaker row decided by another mesh process.
    ///
    /// The remote decision replaces both the durable row and the mirror,
    /// so this process gates calls the same way the sender does. No event
    /// is published; the sender already announced the change.
    pub fn apply_remote(&self, app_id: &str, record: BreakerRecord) -> StateResult<()> {
        let (old, new) = self.store.update_breaker(app_id, |_| record)?;
        if old.state != new.state {
            info!(
                app_id,
                from = old.state.as_str(),
                to = new.state.as_str(),
                "breaker state adopted from remote"
            );
        }
        self.remember(app_id, new);
        Ok(())
    }

    /// Every breaker row this process has touched, sorted by app-id.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mirror = self.mirror.read().expect("breaker mirror lock");
        let mut rows: Vec<BreakerSnapshot> = mirror
            .iter()
            .map(|(app_id, r)| BreakerSnapshot {
                app_id: app_id.clone(),
                state: r.state,
                consecutive_failures: r.consecutive_failures,
                opened_at: r.opened_at,
            })
            .collect();
        rows.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        rows
    }

    /// Mirror read with store fallback on miss.
    fn current(&self, app_id: &str) -> StateResult<BreakerRecord> {
        if let Some(record) = self
            .mirror
            .read()
            .expect("breaker mirror lock")
            .get(app_id)
            .copied()
        {
            return Ok(record);
        }
        let record = self.store.breaker_record(app_id)?;
        self.remember(app_id, record);
        Ok(record)
    }

    fn remember(&self, app_id: &str, record: BreakerRecord) {
        let mut mirror = self.mirror.write().expect("breaker mirror lock");
        mirror.insert(app_id.to_string(), record);
    }

    /// Refresh the mirror and announce the transition if the state moved.
    fn finish_transition(&self, app_id: &str, old: BreakerRecord, new: BreakerRecord) {
        self.remember(app_id, new);
        if old.state == new.state {
            return;
        }
        match new.state {
            CircuitState::Open => warn!(
                app_id,
                failures = new.consecutive_failures,
                "circuit opened"
            ),
            CircuitState::HalfOpen => info!(app_id, "circuit half-open, admitting probes"),
            CircuitState::Closed => info!(app_id, "circuit closed"),
        }
        self.bus.publish(MeshEvent::CircuitStateChanged {
            app_id: app_id.to_string(),
            state: new.state,
            consecutive_failures: new.consecutive_failures,
        });
        debug!(app_id, state = new.state.as_str(), "breaker transition recorded");
    }
}
