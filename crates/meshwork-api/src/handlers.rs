//! REST API handlers.
//!
//! Each handler delegates to the registry, router, or breaker and wraps
//! the result in a consistent JSON envelope.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use meshwork_events::{DeregisterReason, HeartbeatSignal, Signal};
use meshwork_registry::RegisterRequest;
use meshwork_router::Algorithm;
use meshwork_state::{AppId, BreakerRecord, EndpointStatus, StateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse + use<> {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Store failures are 503 (the mesh depends on the store being up);
/// missing entities are 404.
fn state_error(e: &StateError) -> impl IntoResponse {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(&e.to_string(), status)
}

// ── Endpoints ──────────────────────────────────────────────────

/// POST /v1/endpoints
pub async fn register_endpoint(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    if request.app_id.is_empty() {
        return error_response("app_id is required", StatusCode::BAD_REQUEST).into_response();
    }
    match state.registry.register(request) {
        Ok(instance_id) => (
            StatusCode::CREATED,
            ApiResponse::ok(serde_json::json!({ "instance_id": instance_id })),
        )
            .into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /v1/endpoints/{instance_id}
pub async fn get_endpoint(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get_endpoint(&instance_id) {
        Ok(endpoint) => ApiResponse::ok(endpoint).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// DELETE /v1/endpoints/{instance_id}
pub async fn deregister_endpoint(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    match state
        .registry
        .deregister(&instance_id, DeregisterReason::Graceful)
    {
        Ok(true) => ApiResponse::ok(serde_json::json!({ "deregistered": true })).into_response(),
        Ok(false) => error_response("endpoint not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// POST /v1/endpoints/{instance_id}/heartbeat
///
/// The path names the instance; an `instance_id` in the body is ignored.
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(mut signal): Json<HeartbeatSignal>,
) -> impl IntoResponse {
    if signal.app_id.is_empty() {
        return error_response("app_id is required", StatusCode::BAD_REQUEST).into_response();
    }
    signal.instance_id = instance_id;
    match state.registry.heartbeat(&signal) {
        Ok(ack) => ApiResponse::ok(ack).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// Query for the app endpoint listing.
#[derive(Deserialize)]
pub struct EndpointsQuery {
    pub service_name: Option<String>,
    #[serde(default = "default_true")]
    pub healthy_only: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EndpointsQuery {
    fn default() -> Self {
        Self {
            service_name: None,
            healthy_only: true,
        }
    }
}

/// GET /v1/apps/{app_id}/endpoints
pub async fn app_endpoints(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Query(query): Query<EndpointsQuery>,
) -> impl IntoResponse {
    match state
        .registry
        .get_endpoints(&app_id, query.service_name.as_deref(), query.healthy_only)
    {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// Query for the global endpoint summary.
#[derive(Default, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub status: Option<EndpointStatus>,
}

/// GET /v1/endpoints
pub async fn list_endpoints(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state
        .registry
        .list_endpoints(query.prefix.as_deref(), query.status)
    {
        Ok(summaries) => ApiResponse::ok(summaries).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Routing ────────────────────────────────────────────────────

/// Query for a route request.
#[derive(Default, Deserialize)]
pub struct RouteQuery {
    /// When set, resolves through the mapping table instead of taking the
    /// path app-id literally.
    pub service_name: Option<String>,
    pub algorithm: Option<Algorithm>,
}

/// GET /v1/apps/{app_id}/route
pub async fn get_route(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Query(query): Query<RouteQuery>,
) -> impl IntoResponse {
    let target = match &query.service_name {
        Some(name) => state.router.resolve_app_id(name),
        None => app_id,
    };
    match state.router.route_for_app(&target, query.algorithm) {
        Ok(Some(decision)) => ApiResponse::ok(decision).into_response(),
        Ok(None) => error_response(
            &format!("no endpoint available for {target}"),
            StatusCode::NOT_FOUND,
        )
        .into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Mappings ───────────────────────────────────────────────────

/// Query for the mapping table.
#[derive(Default, Deserialize)]
pub struct MappingsQuery {
    pub prefix: Option<String>,
}

/// GET /v1/mappings
pub async fn get_mappings(
    State(state): State<ApiState>,
    Query(query): Query<MappingsQuery>,
) -> impl IntoResponse {
    let (mut mappings, version) = state.router.mapping_snapshot();
    if let Some(prefix) = &query.prefix {
        mappings.retain(|name, _| name.starts_with(prefix.as_str()));
    }
    ApiResponse::ok(serde_json::json!({
        "mappings": mappings,
        "version": version,
    }))
}

/// PUT /v1/mappings body.
#[derive(Deserialize)]
pub struct MappingsUpdate {
    /// An empty set resets every known service name to the default app-id.
    #[serde(default)]
    pub mappings: BTreeMap<String, AppId>,
}

/// PUT /v1/mappings
pub async fn put_mappings(
    State(state): State<ApiState>,
    Json(update): Json<MappingsUpdate>,
) -> impl IntoResponse {
    let (version, count) = state.router.replace_mappings(update.mappings);
    ApiResponse::ok(serde_json::json!({
        "version": version,
        "count": count,
    }))
}

// ── Signals ────────────────────────────────────────────────────

/// POST /v1/signals
///
/// Single ingestion point for the external event channel: heartbeats,
/// mapping snapshots, and circuit state broadcasts all land here.
pub async fn ingest_signal(
    State(state): State<ApiState>,
    Json(signal): Json<Signal>,
) -> impl IntoResponse {
    match signal {
        Signal::Heartbeat(heartbeat) => {
            if heartbeat.app_id.is_empty() || heartbeat.instance_id.is_empty() {
                return error_response(
                    "heartbeat signal requires app_id and instance_id",
                    StatusCode::BAD_REQUEST,
                )
                .into_response();
            }
            match state.registry.heartbeat(&heartbeat) {
                Ok(ack) => ApiResponse::ok(ack).into_response(),
                Err(e) => state_error(&e).into_response(),
            }
        }
        Signal::MappingSnapshot { mappings } => {
            let (version, count) = state.router.replace_mappings(mappings);
            ApiResponse::ok(serde_json::json!({
                "version": version,
                "count": count,
            }))
            .into_response()
        }
        Signal::CircuitState {
            app_id,
            state: circuit_state,
            consecutive_failures,
            opened_at,
        } => {
            let record = BreakerRecord {
                state: circuit_state,
                consecutive_failures,
                opened_at,
            };
            match state.breaker.apply_remote(&app_id, record) {
                Ok(()) => ApiResponse::ok(serde_json::json!({ "applied": true })).into_response(),
                Err(e) => state_error(&e).into_response(),
            }
        }
    }
}

// ── Breakers ───────────────────────────────────────────────────

/// GET /v1/breakers
pub async fn list_breakers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.breaker.snapshot())
}

// ── Health ─────────────────────────────────────────────────────

/// GET /v1/health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list_endpoints(None, None) {
        Ok(summaries) => {
            let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
            let mut total = 0usize;
            for summary in &summaries {
                total += summary.total;
                for (status, count) in &summary.by_status {
                    *by_status.entry(status.clone()).or_insert(0) += count;
                }
            }
            let healthy = by_status.get("healthy").copied().unwrap_or(0);
            let status = if healthy == total { "healthy" } else { "degraded" };
            ApiResponse::ok(serde_json::json!({
                "status": status,
                "uptime_secs": state.started_at.elapsed().as_secs(),
                "apps": summaries.len(),
                "total_endpoints": total,
                "by_status": by_status,
            }))
            .into_response()
        }
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let summaries = state.registry.list_endpoints(None, None).unwrap_or_default();
    let breakers = state.breaker.snapshot();
    let (_, mapping_version) = state.router.mapping_snapshot();
    let body = crate::metrics::render_prometheus(&summaries, &breakers, mapping_version);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
