//! Meshwork event bus and cross-process signals.
//!
//! [`MeshEvent`] describes lifecycle transitions observed by the mesh
//! (registrations, degradations, circuit state changes) and fans out to
//! subscribers over a bounded [`EventBus`]. [`Signal`] is the wire
//! envelope remote mesh processes POST to the control API: heartbeats,
//! mapping snapshots, and circuit state broadcasts.

mod bus;
mod event;
mod signal;

pub use bus::{EventBus, EVENT_BUFFER};
pub use event::{DegradeReason, DeregisterReason, MeshEvent};
pub use signal::{HeartbeatSignal, Signal};
