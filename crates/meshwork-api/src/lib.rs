//! meshwork-api — REST API for the mesh control plane.
//!
//! Provides axum route handlers for endpoint registration, heartbeats,
//! routing decisions, mapping snapshots, breaker state, and inbound
//! signal ingestion.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/endpoints` | Register an endpoint |
//! | GET | `/v1/endpoints` | Per-app summary, filterable |
//! | GET | `/v1/endpoints/{instance_id}` | Fetch one endpoint |
//! | DELETE | `/v1/endpoints/{instance_id}` | Graceful deregistration |
//! | POST | `/v1/endpoints/{instance_id}/heartbeat` | Heartbeat / lease renewal |
//! | GET | `/v1/apps/{app_id}/endpoints` | Endpoints for an app |
//! | GET | `/v1/apps/{app_id}/route` | Route decision |
//! | GET | `/v1/mappings` | Service-name mapping table |
//! | PUT | `/v1/mappings` | Replace the mapping table |
//! | POST | `/v1/signals` | Inbound signal envelope |
//! | GET | `/v1/breakers` | Circuit breaker snapshot |
//! | GET | `/v1/health` | Mesh health rollup |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod metrics;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};

use meshwork_breaker::CircuitBreaker;
use meshwork_registry::Registry;
use meshwork_router::MeshRouter;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Registry,
    pub router: Arc<MeshRouter>,
    pub breaker: Arc<CircuitBreaker>,
    /// Process start, for the health endpoint's uptime.
    pub started_at: Instant,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let v1 = Router::new()
        .route(
            "/endpoints",
            get(handlers::list_endpoints).post(handlers::register_endpoint),
        )
        .route(
            "/endpoints/{instance_id}",
            get(handlers::get_endpoint).delete(handlers::deregister_endpoint),
        )
        .route(
            "/endpoints/{instance_id}/heartbeat",
            post(handlers::heartbeat),
        )
        .route("/apps/{app_id}/endpoints", get(handlers::app_endpoints))
        .route("/apps/{app_id}/route", get(handlers::get_route))
        .route(
            "/mappings",
            get(handlers::get_mappings).put(handlers::put_mappings),
        )
        .route("/signals", post(handlers::ingest_signal))
        .route("/breakers", get(handlers::list_breakers))
        .route("/health", get(handlers::health))
        .with_state(state.clone());

    Router::new()
        .nest("/v1", v1)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
