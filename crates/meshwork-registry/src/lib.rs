//! Meshwork registry service.
//!
//! The registry is the write path for endpoint state: explicit
//! registration and deregistration, heartbeat ingestion (which doubles as
//! auto-registration for instances the mesh has never seen), and the read
//! views the API serves. Health is computed at read time: a stored status
//! is downgraded to Degraded once the heartbeat goes stale, without a
//! background pass rewriting rows.

mod registry;

pub use registry::{
    AppSummary, EndpointsView, HeartbeatAck, RegisterRequest, Registry, RegistryConfig,
};
