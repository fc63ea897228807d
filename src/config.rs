use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::connectors::ServerDescriptor;
use crate::error::DbError;

fn default_ttl_secs() -> u64 {
    300
}

/// Result-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// TTL for cached query results; 0 keeps them until evicted.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Engine settings, read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub servers: Vec<ServerDescriptor>,
    /// Schema definitions document. Relative paths resolve against the
    /// config file's directory.
    pub definitions: PathBuf,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, DbError> {
        let json = fs::read_to_string(path)
            .map_err(|e| DbError::Configuration(format!("cannot read config {:?}: {}", path, e)))?;
        let mut config: EngineConfig = serde_json::from_str(&json)?;

        if config.definitions.is_relative() {
            if let Some(dir) = path.parent() {
                config.definitions = dir.join(&config.definitions);
            }
        }
        if config.servers.is_empty() {
            return Err(DbError::Configuration(format!("no servers configured in {:?}", path)));
        }
        log::debug!(
            "Loaded config {:?}: {} servers, definitions at {:?}",
            path,
            config.servers.len(),
            config.definitions
        );
        Ok(config)
    }
}
