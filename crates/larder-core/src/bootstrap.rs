//! Build an engine and an initialised facade from configuration

use larder_engine::{Engine, MemoryBackend, SqliteBackend};
use larder_storage::Storage;

use crate::config::{BackendConfig, Config};
use crate::Result;

pub fn build_engine(config: &Config) -> Result<Engine> {
    let options = config.engine_options();
    let engine = match &config.backend {
        BackendConfig::Memory => Engine::new(MemoryBackend::new(), options),
        BackendConfig::Sqlite { path } => {
            // Ensure data directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Engine::new(SqliteBackend::open(path)?, options)
        }
    };
    Ok(engine)
}

/// Open the configured database and create its stores
pub async fn open(config: &Config) -> Result<Storage> {
    config.validate()?;

    let storage = Storage::new(build_engine(config)?);
    storage
        .init(&config.database, config.stores.as_slice(), config.version)
        .await?;

    tracing::info!(
        database = %config.database,
        stores = ?config.stores,
        version = config.version,
        "Storage ready"
    );
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use larder_engine::Key;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("larder-{}-{}", label, std::process::id()))
    }

    #[tokio::test]
    async fn test_open_in_memory() {
        let storage = open(&Config::in_memory()).await.unwrap();

        assert!(storage.set("items", "a", json!({"x": 1})).await.unwrap());
        assert_eq!(storage.get("items", "a").await.unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = temp_dir("reopen");
        let config = Config::new(dir.join("nested"));

        let storage = open(&config).await.unwrap();
        storage.set("items", 1, "kept").await.unwrap();
        storage.close();
        drop(storage);

        let storage = open(&config).await.unwrap();
        assert_eq!(storage.get("items", 1).await.unwrap(), Some(json!("kept")));
        storage.close();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = Config {
            version: 0,
            ..Config::in_memory()
        };
        assert!(matches!(open(&config).await, Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_cursor_only_engine() {
        let config = Config {
            bulk_retrieval: false,
            ..Config::in_memory()
        };
        let storage = open(&config).await.unwrap();
        storage.set("items", "b", 2).await.unwrap();
        storage.set("items", "a", 1).await.unwrap();

        assert_eq!(
            storage.keys("items").await.unwrap(),
            vec![Key::from("a"), Key::from("b")]
        );
    }
}
