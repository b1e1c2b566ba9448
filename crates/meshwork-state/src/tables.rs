//! redb table definitions for the meshwork endpoint store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types, except the global index whose values are raw app-id bytes).

use redb::TableDefinition;

/// Endpoint rows keyed by `{instance_id}`, values are `EndpointRow` JSON
/// (the record plus its expiry stamp).
pub const ENDPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoints");

/// App index keyed by `{app_id}`, values are a JSON map of
/// `instance_id → expires_at_ms` mirroring each member's endpoint TTL.
pub const APP_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("app_index");

/// Global instance index keyed by `{instance_id}`, values are the owning
/// app-id as raw bytes. No expiry — cleaned lazily during full listings.
pub const GLOBAL_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("global_index");

/// Circuit breaker rows keyed by `{app_id}`, values are `BreakerRecord` JSON.
pub const BREAKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("breakers");
