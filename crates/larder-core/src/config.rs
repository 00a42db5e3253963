//! Storage configuration

use larder_engine::EngineOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::Result;

/// Where entries are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Lost when the process exits
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logical database name
    pub database: String,
    /// Stores created on first open
    pub stores: Vec<String>,
    /// Schema version; raising it creates newly listed stores
    pub version: u32,
    pub backend: BackendConfig,
    /// Use bulk retrieval when listing a store, instead of walking a cursor
    pub bulk_retrieval: bool,
    /// Upper bound on stored key and value bytes
    pub quota_bytes: Option<u64>,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database: "larder".to_string(),
            stores: vec!["items".to_string()],
            version: 1,
            backend: BackendConfig::Sqlite {
                path: data_dir.join("larder.db"),
            },
            bulk_retrieval: true,
            quota_bytes: None,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: BackendConfig::Memory,
            ..Self::default()
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("larder"))
            .unwrap_or_else(|| PathBuf::from(".larder"))
    }

    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;

        tracing::debug!(path = %path.as_ref().display(), database = %config.database, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(CoreError::Config("database name must not be empty".to_string()));
        }
        if self.version == 0 {
            return Err(CoreError::Config("version must be at least 1".to_string()));
        }
        if let Some(store) = self.stores.iter().find(|s| s.is_empty()) {
            return Err(CoreError::Config(format!("invalid store name {:?}", store)));
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            bulk_retrieval: self.bulk_retrieval,
            quota_bytes: self.quota_bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

// Simple dirs implementation for the platform data directory
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
