//! mesh.toml configuration.
//!
//! Every key has a default; an absent file, an empty file, and a file
//! setting only the keys it cares about are all valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use meshwork_breaker::BreakerConfig;
use meshwork_client::ClientConfig;
use meshwork_health::HealthCheckConfig;
use meshwork_registry::RegistryConfig;
use meshwork_router::RouterConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Port the REST API listens on.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 7400 }
    }
}

/// Top-level daemon configuration, one section per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Directory holding the embedded store.
    pub data_dir: PathBuf,
    /// Seconds between expired-record sweeps.
    pub purge_interval_secs: u64,
    pub api: ApiConfig,
    pub registry: RegistryConfig,
    pub router: RouterConfig,
    pub breaker: BreakerConfig,
    pub client: ClientConfig,
    pub health_check: HealthCheckConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/meshwork"),
            purge_interval_secs: 60,
            api: ApiConfig::default(),
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
            breaker: BreakerConfig::default(),
            client: ClientConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load a config file when a path is given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
