//! Load balancing algorithms over a candidate endpoint list.
//!
//! Every algorithm selects an index into the caller-supplied candidate
//! slice. Stateless algorithms (random, least-connections, weighted
//! random) decide from the candidates alone; stateful ones (round-robin,
//! smooth weighted round-robin) keep a cursor per app-id in a
//! capacity-capped table, evicting the least recently used app when the
//! cap is reached.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use meshwork_state::{AppId, Endpoint, InstanceId};

/// Balancing algorithm for endpoint selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    Weighted,
    WeightedRoundRobin,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::Random => "random",
            Algorithm::Weighted => "weighted",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "random" => Ok(Algorithm::Random),
            "weighted" => Ok(Algorithm::Weighted),
            "weighted_round_robin" => Ok(Algorithm::WeightedRoundRobin),
            other => Err(format!("unknown algorithm: {other}")),
        }
    }
}

/// Selection weight for load-aware algorithms. Lightly loaded endpoints
/// weigh more; a saturated endpoint keeps a floor weight of 1 so it is
/// never fully starved.
fn weight(endpoint: &Endpoint) -> u32 {
    100u32.saturating_sub(endpoint.load_percent as u32).max(1)
}

/// Balancer state for one app-id.
#[derive(Default)]
struct AppState {
    rr_cursor: u64,
    /// Smooth WRR current weights, keyed by instance id.
    wrr_weights: HashMap<InstanceId, i64>,
    last_used: u64,
}

/// Endpoint selector with per-app state.
pub struct Balancer {
    capacity: usize,
    tick: AtomicU64,
    apps: Mutex<HashMap<AppId, AppState>>,
}

impl Balancer {
    /// Create a balancer tracking state for at most `capacity` app-ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
            apps: Mutex::new(HashMap::new()),
        }
    }

    /// Pick one candidate index with the given algorithm.
    ///
    /// Returns `None` only when `candidates` is empty. Tie breaks on
    /// least-connections go to the first candidate in list order.
    pub fn pick(
        &self,
        algorithm: Algorithm,
        app_id: &str,
        candidates: &[Endpoint],
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let idx = match algorithm {
            Algorithm::Random => rand::rng().random_range(0..candidates.len()),
            Algorithm::LeastConnections => {
                candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.current_connections)
                    .map(|(idx, _)| idx)?
            }
            Algorithm::Weighted => weighted_random(candidates),
            Algorithm::RoundRobin => self.with_app(app_id, |state| {
                let idx = (state.rr_cursor % candidates.len() as u64) as usize;
                state.rr_cursor = state.rr_cursor.wrapping_add(1);
                idx
            }),
            Algorithm::WeightedRoundRobin => {
                self.with_app(app_id, |state| smooth_wrr(&mut state.wrr_weights, candidates))
            }
        };
        Some(idx)
    }

    /// Drop all balancer state for an app-id.
    pub fn reset(&self, app_id: &str) {
        let mut apps = self.apps.lock().expect("balancer lock");
        apps.remove(app_id);
    }

    /// App-ids with live balancer state, sorted (for diagnostics).
    pub fn tracked_apps(&self) -> Vec<AppId> {
        let apps = self.apps.lock().expect("balancer lock");
        let mut ids: Vec<AppId> = apps.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `f` against the app's state, creating it if needed and evicting
    /// the least recently used app when the table is at capacity.
    fn with_app<T>(&self, app_id: &str, f: impl FnOnce(&mut AppState) -> T) -> T {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let mut apps = self.apps.lock().expect("balancer lock");
        if !apps.contains_key(app_id) && apps.len() >= self.capacity {
            let evict = apps
                .iter()
                .min_by_key(|(_, state)| state.last_used)
                .map(|(id, _)| id.clone());
            if let Some(id) = evict {
                apps.remove(&id);
                debug!(app_id = %id, "evicted balancer state");
            }
        }
        let state = apps.entry(app_id.to_string()).or_default();
        state.last_used = tick;
        f(state)
    }
}

/// Single weighted-random draw across the candidates.
fn weighted_random(candidates: &[Endpoint]) -> usize {
    let total: u32 = candidates.iter().map(weight).sum();
    let mut roll = rand::rng().random_range(0..total);
    for (idx, endpoint) in candidates.iter().enumerate() {
        let w = weight(endpoint);
        if roll < w {
            return idx;
        }
        roll -= w;
    }
    candidates.len() - 1
}

/// Smooth weighted round-robin: add each candidate's effective weight to
/// its current weight, pick the largest, then charge the winner the total
/// effective weight. Wins converge to the weight ratio without sending a
/// burst to the heaviest endpoint first.
fn smooth_wrr(weights: &mut HashMap<InstanceId, i64>, candidates: &[Endpoint]) -> usize {
    // Forget endpoints that left the candidate set.
    weights.retain(|id, _| candidates.iter().any(|e| &e.instance_id == id));

    let mut total = 0i64;
    let mut best = 0;
    let mut best_weight = i64::MIN;
    for (idx, endpoint) in candidates.iter().enumerate() {
        let eff = weight(endpoint) as i64;
        total += eff;
        let current = weights.entry(endpoint.instance_id.clone()).or_insert(0);
        *current += eff;
        if *current > best_weight {
            best_weight = *current;
            best = idx;
        }
    }
    if let Some(current) = weights.get_mut(&candidates[best].instance_id) {
        *current -= total;
    }
    best
}
