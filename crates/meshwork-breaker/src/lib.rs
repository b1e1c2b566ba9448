//! Meshwork circuit breaker.
//!
//! Tracks consecutive call failures per app-id and fails fast once a
//! threshold is crossed, giving the failing app room to recover. State
//! transitions are applied atomically through the endpoint store, fanned
//! out as [`meshwork_events::MeshEvent::CircuitStateChanged`] events, and
//! mirrored in process memory so the hot allow/deny check stays off the
//! store for settled circuits.

mod breaker;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
