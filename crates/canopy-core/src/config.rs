//! Configuration management for Canopy services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`CANOPY__` prefix, `__` separator)
//! 2. Config file (`canopy.toml`)
//! 3. Defaults

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CanopyConfig {
    /// Base of every entity `uri`.
    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub entities: EntitySettings,

    #[serde(default)]
    pub auth: AuthSettings,
}

/// Which storage backend to use and how long each call may take.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Default per-call storage timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub neo4j: Neo4jSettings,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Neo4j,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jSettings {
    #[serde(default = "default_neo4j_uri")]
    pub uri: String,
    #[serde(default = "default_neo4j_user")]
    pub user: String,
    #[serde(default = "default_neo4j_password")]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySettings {
    /// Optimistic-concurrency attempts before an update gives up.
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,

    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSettings {
    /// Inactivity timeout (seconds) for roles created without one. 0 = never.
    #[serde(default)]
    pub default_inactivity_secs: u64,
}

fn default_base_uri() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_neo4j_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_neo4j_user() -> String {
    "neo4j".to_string()
}

fn default_neo4j_password() -> String {
    "canopy-dev".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_fetch_size() -> usize {
    256
}

fn default_max_update_retries() -> u32 {
    5
}

fn default_page_size() -> usize {
    10
}

fn default_max_page_size() -> usize {
    1_000
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            base_uri: default_base_uri(),
            store: StoreSettings::default(),
            entities: EntitySettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout_ms: default_timeout_ms(),
            neo4j: Neo4jSettings::default(),
        }
    }
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            uri: default_neo4j_uri(),
            user: default_neo4j_user(),
            password: default_neo4j_password(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            max_update_retries: default_max_update_retries(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl CanopyConfig {
    /// Load from `{file_prefix}.toml` (optional) and `CANOPY__*` variables.
    pub fn load(file_prefix: &str) -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("CANOPY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = cfg.try_deserialize()?;
        tracing::debug!(
            backend = ?loaded.store.backend,
            timeout_ms = loaded.store.timeout_ms,
            "Configuration loaded"
        );
        Ok(loaded)
    }

    /// Clamp a requested page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.entities.default_page_size)
            .clamp(1, self.entities.max_page_size.max(1))
    }
}
