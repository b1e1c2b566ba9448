//! meshwork-health — background health checking for registered endpoints.
//!
//! A single worker sweeps every registered endpoint on a fixed interval
//! (after an initial startup delay), probing each instance's health path
//! with a short timeout. Consecutive failures are tracked in worker-local
//! memory only; once an instance crosses the failure threshold it is
//! deregistered with reason `HealthCheckFailed`.
//!
//! # Architecture
//!
//! ```text
//! HealthWorker (one background task)
//!   ├── sweep every interval_secs
//!   │   ├── http_probe() → ProbeResult per endpoint
//!   │   ├── ProbeTracker (consecutive failures, stale flags)
//!   │   └── Registry::deregister(HealthCheckFailed) at threshold
//!   └── publishes health-check-failed and degraded events
//! ```
//!
//! The worker never rewrites endpoint rows itself: a probe failure below
//! the threshold is only a warning event, and heartbeat staleness is
//! reported once per transition without touching the store. Setting the
//! failure threshold to zero keeps the probes (and their warning events)
//! but leaves TTL expiry as the only removal path.

pub mod prober;
pub mod worker;

pub use prober::{ProbeResult, ProbeTracker, http_probe};
pub use worker::{HealthCheckConfig, HealthWorker};
