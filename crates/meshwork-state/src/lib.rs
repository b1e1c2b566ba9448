//! meshwork-state — embedded endpoint store for the mesh.
//!
//! Backed by [redb](https://docs.rs/redb), persists endpoint records with
//! per-key expiry, the app-id → instance-id index, the global instance
//! index, and circuit breaker rows.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Endpoint rows carry an `expires_at` stamp refreshed on every write; reads
//! treat expired rows as absent. The app index mirrors each member's expiry
//! and is pruned when read. The global index has no expiry of its own —
//! stale ids are dropped lazily when a full listing encounters them, since
//! endpoint TTL already bounds how stale it can get.
//!
//! Circuit breaker rows are mutated only through [`MeshStore::update_breaker`],
//! which applies a closure inside a single write transaction so concurrent
//! failure reports never lose updates.
//!
//! The `MeshStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::MeshStore;
pub use types::*;
