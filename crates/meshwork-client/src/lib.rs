//! meshwork-client — outbound service invocation with mesh resilience.
//!
//! Wraps a pooled HTTP client with the full invocation pipeline: circuit
//! breaker gate, cached endpoint resolution through the router, retries
//! with exponential backoff for transient upstream failures, and breaker
//! feedback on the final outcome.
//!
//! # Call classification
//!
//! Any 2xx or 4xx response counts as successful delivery; a 4xx is a
//! client-contract problem, not a mesh fault. 408, 429, 5xx, and
//! connection-level errors are transient: the cached endpoint for the
//! app-id is dropped (so the retry may land on a different instance) and
//! the call is retried with doubling delays until the retry budget runs
//! out. Only then does the breaker hear about the failure.
//!
//! [`MeshClient::invoke_raw`] skips the breaker in both directions, for
//! best-effort calls to services that may legitimately be absent.

pub mod client;
pub mod error;

pub use client::{ClientConfig, InvokeResponse, MeshClient};
pub use error::{InvokeError, InvokeResult};
