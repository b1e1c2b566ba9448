//! The invocation pipeline: breaker gate, cached resolution, retries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use moka::sync::Cache;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use meshwork_breaker::CircuitBreaker;
use meshwork_router::MeshRouter;
use meshwork_state::{AppId, Endpoint};

use crate::error::{InvokeError, InvokeResult};

/// Invocation client settings (`[client]` section of the daemon config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Retries after the initial attempt, for transient failures only.
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry.
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// How long a resolved endpoint is reused before asking the router
    /// again.
    pub route_cache_ttl_ms: u64,
    pub route_cache_capacity: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 200,
            connect_timeout_ms: 500,
            request_timeout_ms: 5000,
            route_cache_ttl_ms: 2000,
            route_cache_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn route_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.route_cache_ttl_ms)
    }
}

/// Response from an invoked service. 4xx statuses land here too; only
/// transport-level failures and transient statuses become errors.
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub status: u16,
    pub body: Bytes,
}

impl InvokeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Outcome of one network attempt.
enum Outcome {
    Delivered(InvokeResponse),
    Transient(String),
}

/// Service-to-service caller with breaker gating, cached endpoint
/// resolution, and retry with exponential backoff.
pub struct MeshClient {
    http: reqwest::Client,
    router: Arc<MeshRouter>,
    breaker: Arc<CircuitBreaker>,
    route_cache: Cache<AppId, Endpoint>,
    config: ClientConfig,
}

impl MeshClient {
    pub fn new(
        router: Arc<MeshRouter>,
        breaker: Arc<CircuitBreaker>,
        config: ClientConfig,
    ) -> InvokeResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .build()?;
        let route_cache = Cache::builder()
            .max_capacity(config.route_cache_capacity)
            .time_to_live(config.route_cache_ttl())
            .build();
        Ok(Self {
            http,
            router,
            breaker,
            route_cache,
            config,
        })
    }

    /// Invoke `method` on an instance of `app_id` with a JSON request body.
    ///
    /// The breaker is consulted before any network attempt and hears the
    /// final outcome: success on delivery, one failure after the retry
    /// budget is exhausted. Resolution and routing errors carry no
    /// breaker feedback since no upstream was reached.
    pub async fn invoke<B: Serialize + ?Sized>(
        &self,
        app_id: &str,
        method: &str,
        body: &B,
    ) -> InvokeResult<InvokeResponse> {
        if !self.breaker.is_call_allowed(app_id)? {
            debug!(%app_id, %method, "circuit open, failing fast");
            return Err(InvokeError::CircuitOpen {
                app_id: app_id.to_string(),
            });
        }

        match self.call_with_retries(app_id, method, body).await {
            Ok(response) => {
                if let Err(e) = self.breaker.record_success(app_id) {
                    error!(%app_id, error = %e, "failed to record breaker success");
                }
                Ok(response)
            }
            Err(e @ InvokeError::RetriesExhausted { .. }) => {
                if let Err(store_err) = self.breaker.record_failure(app_id) {
                    error!(%app_id, error = %store_err, "failed to record breaker failure");
                }
                Err(e)
            }
            Err(other) => Err(other),
        }
    }

    /// Invoke a service by logical name, resolving it through the mapping
    /// table first.
    pub async fn invoke_service<B: Serialize + ?Sized>(
        &self,
        service_name: &str,
        method: &str,
        body: &B,
    ) -> InvokeResult<InvokeResponse> {
        let app_id = self.router.resolve_app_id(service_name);
        self.invoke(&app_id, method, body).await
    }

    /// Best-effort invocation that bypasses the breaker in both
    /// directions: it is never gated, and its failures never move circuit
    /// state. For optional services that may be absent by design.
    pub async fn invoke_raw<B: Serialize + ?Sized>(
        &self,
        app_id: &str,
        method: &str,
        body: &B,
    ) -> InvokeResult<InvokeResponse> {
        self.call_with_retries(app_id, method, body).await
    }

    /// Drop the cached route for an app-id. Called on deregistration
    /// events so the next invoke re-resolves.
    pub fn forget_route(&self, app_id: &str) {
        self.route_cache.invalidate(app_id);
    }

    /// Currently cached route for an app-id, if any.
    pub fn cached_route(&self, app_id: &str) -> Option<Endpoint> {
        self.route_cache.get(app_id)
    }

    async fn call_with_retries<B: Serialize + ?Sized>(
        &self,
        app_id: &str,
        method: &str,
        body: &B,
    ) -> InvokeResult<InvokeResponse> {
        let path = method.trim_start_matches('/');
        let mut attempts = 0u32;
        loop {
            let endpoint = self.resolve(app_id)?;
            let url = format!("http://{}/{}", endpoint.address(), path);
            attempts += 1;

            let reason = match self.attempt(&url, body).await {
                Outcome::Delivered(response) => return Ok(response),
                Outcome::Transient(reason) => reason,
            };

            if attempts > self.config.max_retries {
                return Err(InvokeError::RetriesExhausted {
                    app_id: app_id.to_string(),
                    attempts,
                    reason,
                });
            }

            // The same instance may be the problem: drop it from the cache
            // so the retry can resolve a different one.
            self.route_cache.invalidate(app_id);
            let delay = self.backoff(attempts);
            warn!(
                %app_id,
                %method,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn resolve(&self, app_id: &str) -> InvokeResult<Endpoint> {
        if let Some(endpoint) = self.route_cache.get(app_id) {
            return Ok(endpoint);
        }
        let endpoint = self
            .router
            .select_endpoint(app_id)?
            .ok_or_else(|| InvokeError::NoEndpoint {
                app_id: app_id.to_string(),
            })?;
        self.route_cache
            .insert(app_id.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    async fn attempt<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Outcome {
        match self.http.post(url).json(body).send().await {
            Ok(response) => {
                let status = response.status();
                if is_transient(status) {
                    return Outcome::Transient(format!("upstream returned {status}"));
                }
                match response.bytes().await {
                    Ok(bytes) => Outcome::Delivered(InvokeResponse {
                        status: status.as_u16(),
                        body: bytes,
                    }),
                    Err(e) => Outcome::Transient(format!("body read failed: {e}")),
                }
            }
            Err(e) => Outcome::Transient(format!("request failed: {e}")),
        }
    }

    /// Delay before the retry following attempt `attempt`: the base delay
    /// doubled for each attempt already made.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(factor))
    }
}

/// Whether a status is worth retrying. Everything else, 4xx included,
/// counts as delivered.
fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}
