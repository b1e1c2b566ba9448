//! Health probe logic.
//!
//! Performs HTTP probes against endpoint addresses and keeps the
//! worker-local memory of consecutive failures per instance.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use meshwork_state::InstanceId;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health path returned 2xx.
    Healthy,
    /// The health path returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Worker-local probe memory. Counters live here and nowhere else, so a
/// restarted worker starts every instance back at zero.
#[derive(Debug, Default)]
pub struct ProbeTracker {
    /// Consecutive probe failures per instance.
    failures: HashMap<InstanceId, u32>,
    /// Instances already flagged for a stale heartbeat.
    stale: HashSet<InstanceId>,
}

impl ProbeTracker {
    /// Record a probe result and return the consecutive failure count
    /// after recording. A healthy probe resets the count to zero.
    pub fn record(&mut self, instance_id: &str, result: ProbeResult) -> u32 {
        match result {
            ProbeResult::Healthy => {
                self.failures.remove(instance_id);
                0
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                let count = self.failures.entry(instance_id.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
        }
    }

    /// Current consecutive failure count for an instance.
    pub fn failures(&self, instance_id: &str) -> u32 {
        self.failures.get(instance_id).copied().unwrap_or(0)
    }

    /// Flag an instance's heartbeat as stale. Returns true only the first
    /// time, so the transition is reported once.
    pub fn flag_stale(&mut self, instance_id: &str) -> bool {
        self.stale.insert(instance_id.to_string())
    }

    /// Clear the stale flag once the heartbeat is fresh again.
    pub fn clear_stale(&mut self, instance_id: &str) {
        self.stale.remove(instance_id);
    }

    /// Drop all memory for one instance. An id that re-registers before
    /// the next sweep's pruning starts from a clean slate.
    pub fn forget(&mut self, instance_id: &str) {
        self.failures.remove(instance_id);
        self.stale.remove(instance_id);
    }

    /// Drop memory for instances that no longer exist in the store.
    pub fn retain_known(&mut self, known: &HashSet<InstanceId>) {
        self.failures.retain(|id, _| known.contains(id));
        self.stale.retain(|id| known.contains(id));
    }
}

/// Perform an HTTP health probe against an endpoint address.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// and `Failed` if the connection fails or the timeout elapses.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "meshwork-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request build failed");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(request).await {
            Ok(response) => {
                if response.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %response.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
