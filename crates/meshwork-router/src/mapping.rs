//! Service-name to app-id mapping table.
//!
//! Callers address logical service names; the mapping table translates
//! them to the app-id that owns the service. The table is replaced as a
//! whole from snapshots (never patched member by member) and carries a
//! version that increments on every replacement, so consumers can tell
//! stale snapshots from current ones.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::info;

use meshwork_state::AppId;

struct MappingInner {
    map: BTreeMap<String, AppId>,
    version: u64,
}

/// Versioned, replace-all mapping from service names to app-ids.
///
/// Unknown service names resolve to the default app-id rather than
/// failing, so a mesh with no mapping snapshot yet still routes.
pub struct MappingTable {
    inner: RwLock<MappingInner>,
    default_app_id: AppId,
}

impl MappingTable {
    pub fn new(default_app_id: impl Into<AppId>) -> Self {
        Self {
            inner: RwLock::new(MappingInner {
                map: BTreeMap::new(),
                version: 0,
            }),
            default_app_id: default_app_id.into(),
        }
    }

    /// App-id owning a service name; the default app-id when unmapped.
    pub fn resolve(&self, service_name: &str) -> AppId {
        let inner = self.inner.read().expect("mapping lock");
        inner
            .map
            .get(service_name)
            .cloned()
            .unwrap_or_else(|| self.default_app_id.clone())
    }

    /// Replace the whole table with a snapshot and bump the version.
    ///
    /// An empty snapshot does not drop the known service names: every
    /// existing name is instead remapped to the default app-id, so a
    /// publisher that momentarily has nothing to say cannot blackhole
    /// routing for names the mesh has already seen.
    pub fn replace(&self, snapshot: BTreeMap<String, AppId>) -> (u64, usize) {
        let mut inner = self.inner.write().expect("mapping lock");
        if snapshot.is_empty() {
            let names: Vec<String> = inner.map.keys().cloned().collect();
            for name in names {
                inner.map.insert(name, self.default_app_id.clone());
            }
        } else {
            inner.map = snapshot;
        }
        inner.version += 1;
        let count = inner.map.len();
        info!(version = inner.version, count, "replaced service mappings");
        (inner.version, count)
    }

    /// Current table contents and version.
    pub fn snapshot(&self) -> (BTreeMap<String, AppId>, u64) {
        let inner = self.inner.read().expect("mapping lock");
        (inner.map.clone(), inner.version)
    }

    pub fn version(&self) -> u64 {
        self.inner.read().expect("mapping lock").version
    }

    pub fn default_app_id(&self) -> &str {
        &self.default_app_id
    }
}
