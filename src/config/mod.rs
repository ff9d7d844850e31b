// Configuration loader.
//
// A `ServerConfig` document with three top-level sections (`server`,
// `resources`, `apis`). `${VAR}` / `${VAR:-default}` substitution runs over
// every string value in the raw TOML document exactly once, before
// deserialization.

pub mod env;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ServiceError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub title: String,
    pub session_ttl_secs: u64,
    pub warmup_targets: Vec<String>,
    pub bind_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            title: "toolhost".to_string(),
            session_ttl_secs: 300,
            warmup_targets: Vec::new(),
            bind_addr: "127.0.0.1:8800".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResourceSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: toml::Table,
}

fn default_enabled() -> bool {
    true
}

/// `server.config` merged with `BackendConfig::default_config()` at
/// session-creation time — never here. This struct only
/// carries what the document says; the merge happens in the session
/// router.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub resources: HashMap<String, ResourceSection>,
    #[serde(default)]
    pub apis: HashMap<String, toml::Table>,
}

impl ServerConfig {
    /// Load and expand a TOML document from disk. Missing file is not an
    /// error — callers get an all-defaults config.
    pub fn load_from_path(path: &Path) -> Result<Self, ServiceError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ServiceError::Io(e)),
        };
        Self::parse(&raw)
    }

    /// Parse an already-read TOML document, after expanding `${VAR}` /
    /// `${VAR:-default}` references against the process environment.
    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let expanded = env::expand_env_vars(raw);
        toml::from_str(&expanded).map_err(|e| ServiceError::Config(e.to_string()))
    }

    pub fn resource_enabled(&self, resource_type: &str) -> bool {
        self.resources
            .get(resource_type)
            .map(|r| r.enabled)
            .unwrap_or(true)
    }

    pub fn resource_config(&self, resource_type: &str) -> serde_json::Value {
        self.resources
            .get(resource_type)
            .map(|r| toml_table_to_json(&r.config))
            .unwrap_or(serde_json::Value::Object(Default::default()))
    }

    pub fn api_config(&self, config_key: &str) -> serde_json::Value {
        self.apis
            .get(config_key)
            .map(toml_table_to_json)
            .unwrap_or(serde_json::Value::Object(Default::default()))
    }
}

fn toml_table_to_json(table: &toml::Table) -> serde_json::Value {
    // `toml::Value` and `serde_json::Value` are both `serde`-transparent;
    // round-tripping through the generic `Serialize`/`Deserialize` impls
    // is the simplest correct conversion and avoids hand-rolling a second
    // tree walker.
    serde_json::to_value(table).unwrap_or(serde_json::Value::Object(Default::default()))
}
