//! Error types for the invocation client.

use thiserror::Error;

use meshwork_state::{AppId, StateError};

/// Result type alias for invocation operations.
pub type InvokeResult<T> = Result<T, InvokeError>;

/// Failure modes of an outbound invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The breaker for this app-id is open; no network attempt was made.
    #[error("circuit open for {app_id}, failing fast")]
    CircuitOpen { app_id: AppId },

    /// No endpoint is registered (or alive) for this app-id.
    #[error("no endpoint available for {app_id}")]
    NoEndpoint { app_id: AppId },

    /// The backing store could not be reached during resolution.
    #[error(transparent)]
    Store(#[from] StateError),

    /// Every attempt failed with a transient fault.
    #[error("invoking {app_id} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        app_id: AppId,
        attempts: u32,
        reason: String,
    },

    /// The underlying HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}
