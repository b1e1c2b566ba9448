//! Meshwork request routing.
//!
//! Resolves logical service names to app-ids through a versioned mapping
//! table, filters an app's registered endpoints down to routable
//! candidates, and picks one with the configured balancing algorithm.
//! Balancer state (round-robin cursors, smooth weighted-round-robin
//! current weights) is kept per app-id in a capacity-capped table.

pub mod balancer;
pub mod mapping;
pub mod router;

pub use balancer::{Algorithm, Balancer};
pub use mapping::MappingTable;
pub use router::{MeshRouter, RouteDecision, RouterConfig};
