//! MeshStore — redb-backed persistence for endpoint and breaker state.
//!
//! Endpoint rows are written together with an expiry stamp and membership
//! in two indexes inside a single write transaction, so a reader never
//! observes a half-registered instance. Expired rows are treated as absent
//! by every read path and physically removed when a listing encounters
//! them or when [`MeshStore::purge_expired`] sweeps.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Stored form of an endpoint: the record plus its expiry stamp.
#[derive(serde::Serialize, serde::Deserialize)]
struct EndpointRow {
    /// Unix timestamp (ms) after which this row is dead.
    expires_at: u64,
    endpoint: Endpoint,
}

impl EndpointRow {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// App index row: member instance ids with the expiry stamp mirrored from
/// each member's endpoint row. A `BTreeMap` keeps listing order stable,
/// which the least-connections tie break and round-robin fairness rely on.
type AppIndexRow = BTreeMap<InstanceId, u64>;

/// Thread-safe endpoint store backed by redb.
#[derive(Clone)]
pub struct MeshStore {
    db: Arc<Database>,
}

impl MeshStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "mesh store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory mesh store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        txn.open_table(APP_INDEX).map_err(map_err!(Table))?;
        txn.open_table(GLOBAL_INDEX).map_err(map_err!(Table))?;
        txn.open_table(BREAKERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Endpoints ──────────────────────────────────────────────────

    /// Insert or update an endpoint with the given TTL.
    ///
    /// Writes the record, refreshes its membership (and expiry stamp) in
    /// the app index, and asserts it in the global index — all in one
    /// transaction. Re-registering an existing instance id overwrites.
    pub fn put_endpoint(&self, endpoint: &Endpoint, ttl: Duration) -> StateResult<()> {
        let now = epoch_ms();
        let expires_at = now.saturating_add(ttl.as_millis() as u64);
        let row = EndpointRow {
            expires_at,
            endpoint: endpoint.clone(),
        };
        let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut endpoints = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
            endpoints
                .insert(endpoint.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut app_index = txn.open_table(APP_INDEX).map_err(map_err!(Table))?;
            let mut members: AppIndexRow = match app_index
                .get(endpoint.app_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => BTreeMap::new(),
            };
            members.insert(endpoint.instance_id.clone(), expires_at);
            let members_value = serde_json::to_vec(&members).map_err(map_err!(Serialize))?;
            app_index
                .insert(endpoint.app_id.as_str(), members_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut global = txn.open_table(GLOBAL_INDEX).map_err(map_err!(Table))?;
            global
                .insert(endpoint.instance_id.as_str(), endpoint.app_id.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an endpoint by instance id. Expired rows read as absent.
    pub fn get_endpoint(&self, instance_id: &str) -> StateResult<Option<Endpoint>> {
        let now = epoch_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        match table.get(instance_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let row: EndpointRow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                if row.is_expired(now) {
                    Ok(None)
                } else {
                    Ok(Some(row.endpoint))
                }
            }
            None => Ok(None),
        }
    }

    /// List the live endpoints registered under an app-id, in stable
    /// (instance-id) order.
    ///
    /// Members whose endpoint row is gone or expired are pruned from the
    /// app index as they are encountered, and expired rows are deleted,
    /// so the index stays a subset of the live endpoint keys.
    pub fn endpoints_for_app(&self, app_id: &str) -> StateResult<Vec<Endpoint>> {
        let now = epoch_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut live = Vec::new();
        {
            let mut endpoints = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
            let mut app_index = txn.open_table(APP_INDEX).map_err(map_err!(Table))?;

            let members: AppIndexRow = match app_index.get(app_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => BTreeMap::new(),
            };

            let mut kept: AppIndexRow = BTreeMap::new();
            let mut dead = Vec::new();
            for (instance_id, _) in &members {
                let row = match endpoints.get(instance_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice::<EndpointRow>(guard.value())
                            .map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
                match row {
                    Some(row) if row.is_expired(now) => dead.push(instance_id.clone()),
                    Some(row) if row.endpoint.app_id == app_id => {
                        kept.insert(instance_id.clone(), row.expires_at);
                        live.push(row.endpoint);
                    }
                    // Missing row, or a live row re-registered under a
                    // different app-id: the member entry is stale.
                    _ => {}
                }
            }
            for instance_id in &dead {
                endpoints
                    .remove(instance_id.as_str())
                    .map_err(map_err!(Write))?;
            }

            if kept.len() != members.len() {
                debug!(
                    app_id,
                    pruned = members.len() - kept.len(),
                    "pruned stale app index members"
                );
                if kept.is_empty() {
                    app_index.remove(app_id).map_err(map_err!(Write))?;
                } else {
                    let value = serde_json::to_vec(&kept).map_err(map_err!(Serialize))?;
                    app_index
                        .insert(app_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(live)
    }

    /// List every live endpoint across all app-ids, walking the global
    /// index instead of scanning the endpoint table.
    ///
    /// Stale global entries (no live endpoint row behind them) are removed
    /// as they are encountered, together with any matching app index
    /// member — the lazy cleanup path that keeps the global index a
    /// superset of the app indexes without its own TTL.
    pub fn all_endpoints(&self) -> StateResult<Vec<Endpoint>> {
        let now = epoch_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut live = Vec::new();
        {
            let mut endpoints = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
            let mut app_index = txn.open_table(APP_INDEX).map_err(map_err!(Table))?;
            let mut global = txn.open_table(GLOBAL_INDEX).map_err(map_err!(Table))?;

            let known: Vec<(InstanceId, AppId)> = global
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, value) = entry.ok()?;
                    let app_id = String::from_utf8(value.value().to_vec()).ok()?;
                    Some((key.value().to_string(), app_id))
                })
                .collect();

            let mut stale = Vec::new();
            for (instance_id, app_id) in &known {
                let row = match endpoints.get(instance_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice::<EndpointRow>(guard.value())
                            .map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
                match row {
                    Some(row) if !row.is_expired(now) => live.push(row.endpoint),
                    _ => stale.push((instance_id.clone(), app_id.clone())),
                }
            }

            for (instance_id, app_id) in &stale {
                endpoints
                    .remove(instance_id.as_str())
                    .map_err(map_err!(Write))?;
                global
                    .remove(instance_id.as_str())
                    .map_err(map_err!(Write))?;
                Self::remove_index_member(&mut app_index, app_id, instance_id)?;
            }
            if !stale.is_empty() {
                debug!(pruned = stale.len(), "pruned stale global index entries");
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        live.sort_by(|a, b| {
            (a.app_id.as_str(), a.instance_id.as_str())
                .cmp(&(b.app_id.as_str(), b.instance_id.as_str()))
        });
        Ok(live)
    }

    /// Remove an endpoint and its index entries. Returns the stored record
    /// (even if already expired) so the caller can recover its app-id.
    pub fn remove_endpoint(&self, instance_id: &str) -> StateResult<Option<Endpoint>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut endpoints = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
            removed = match endpoints.remove(instance_id).map_err(map_err!(Write))? {
                Some(guard) => {
                    let row: EndpointRow =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some(row.endpoint)
                }
                None => None,
            };

            let mut global = txn.open_table(GLOBAL_INDEX).map_err(map_err!(Table))?;
            global.remove(instance_id).map_err(map_err!(Write))?;

            if let Some(endpoint) = &removed {
                let mut app_index = txn.open_table(APP_INDEX).map_err(map_err!(Table))?;
                Self::remove_index_member(&mut app_index, &endpoint.app_id, instance_id)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    /// Delete every expired endpoint row together with its index entries.
    /// Returns the number of rows removed.
    pub fn purge_expired(&self) -> StateResult<u32> {
        let now = epoch_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut purged = 0;
        {
            let mut endpoints = txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
            let expired: Vec<(InstanceId, AppId)> = endpoints
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, value) = entry.ok()?;
                    let row: EndpointRow = serde_json::from_slice(value.value()).ok()?;
                    row.is_expired(now)
                        .then(|| (key.value().to_string(), row.endpoint.app_id))
                })
                .collect();

            let mut app_index = txn.open_table(APP_INDEX).map_err(map_err!(Table))?;
            let mut global = txn.open_table(GLOBAL_INDEX).map_err(map_err!(Table))?;
            for (instance_id, app_id) in &expired {
                endpoints
                    .remove(instance_id.as_str())
                    .map_err(map_err!(Write))?;
                global
                    .remove(instance_id.as_str())
                    .map_err(map_err!(Write))?;
                Self::remove_index_member(&mut app_index, app_id, instance_id)?;
                purged += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if purged > 0 {
            debug!(purged, "purged expired endpoints");
        }
        Ok(purged)
    }

    /// Drop one member from an app index row, deleting the row when it
    /// becomes empty.
    fn remove_index_member(
        app_index: &mut redb::Table<'_, &str, &[u8]>,
        app_id: &str,
        instance_id: &str,
    ) -> StateResult<()> {
        let members: Option<AppIndexRow> = match app_index.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
            None => None,
        };
        if let Some(mut members) = members {
            if members.remove(instance_id).is_some() {
                if members.is_empty() {
                    app_index.remove(app_id).map_err(map_err!(Write))?;
                } else {
                    let value = serde_json::to_vec(&members).map_err(map_err!(Serialize))?;
                    app_index
                        .insert(app_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        Ok(())
    }

    // ── Index diagnostics ──────────────────────────────────────────

    /// Member instance ids currently recorded under an app-id (unpruned).
    pub fn app_index_members(&self, app_id: &str) -> StateResult<Vec<InstanceId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APP_INDEX).map_err(map_err!(Table))?;
        match table.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let members: AppIndexRow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(members.into_keys().collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Every instance id currently recorded in the global index (unpruned).
    pub fn global_index_ids(&self) -> StateResult<Vec<InstanceId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GLOBAL_INDEX).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    // ── Circuit breakers ───────────────────────────────────────────

    /// Read the breaker row for an app-id; absent rows read as the default
    /// (Closed, zero failures).
    pub fn breaker_record(&self, app_id: &str) -> StateResult<BreakerRecord> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BREAKERS).map_err(map_err!(Table))?;
        match table.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Ok(BreakerRecord::default()),
        }
    }

    /// Atomically mutate the breaker row for an app-id.
    ///
    /// The closure is applied to the current record inside a single write
    /// transaction — the read and the write cannot interleave with another
    /// writer, so concurrent failure reports never lose counts. Returns
    /// the record before and after the mutation.
    pub fn update_breaker<F>(&self, app_id: &str, f: F) -> StateResult<(BreakerRecord, BreakerRecord)>
    where
        F: FnOnce(BreakerRecord) -> BreakerRecord,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (old, new) = {
            let mut table = txn.open_table(BREAKERS).map_err(map_err!(Table))?;
            let old: BreakerRecord = match table.get(app_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => BreakerRecord::default(),
            };
            let new = f(old);
            let value = serde_json::to_vec(&new).map_err(map_err!(Serialize))?;
            table
                .insert(app_id, value.as_slice())
                .map_err(map_err!(Write))?;
            (old, new)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((old, new))
    }
}
