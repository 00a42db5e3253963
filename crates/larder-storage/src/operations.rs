//! Key-value operations
//!
//! Every call runs in its own single-store transaction and resolves only
//! after that transaction has committed.

use larder_engine::{Engine, Key, TransactionMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::connection::{Connection, ConnectionManager};
use crate::fallback::Retrieval;
use crate::runner::TransactionRunner;
use crate::Result;

#[derive(Clone)]
pub struct Storage {
    connections: ConnectionManager,
    runner: TransactionRunner,
}

impl Storage {
    pub fn new(engine: Engine) -> Self {
        Self::with_manager(ConnectionManager::new(engine))
    }

    pub fn with_manager(connections: ConnectionManager) -> Self {
        let runner = TransactionRunner::new(connections.clone());
        Self {
            connections,
            runner,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn runner(&self) -> &TransactionRunner {
        &self.runner
    }

    /// The live connection, if `init` has succeeded and nothing invalidated it since
    pub fn connection(&self) -> Result<Connection> {
        self.connections.current()
    }

    /// Open `name` at `version` and make sure every store in `stores` exists.
    /// A version of 0 means version 1.
    pub async fn init<S: AsRef<str>>(&self, name: &str, stores: &[S], version: u32) -> Result<bool> {
        self.connections
            .open_database(name, stores, version.max(1))
            .await?;
        Ok(true)
    }

    /// Store `value` under `key`, replacing any existing value
    pub async fn set<V: Serialize>(&self, store: &str, key: impl Into<Key>, value: V) -> Result<bool> {
        let key = key.into();
        let value = serde_json::to_value(value)?;
        tracing::debug!(store = %store, key = %key, "Set");

        self.runner
            .run(store, TransactionMode::ReadWrite, |s| s.put(key, value))
            .await?;
        Ok(true)
    }

    /// `None` when the key is absent. A stored `null` is `Some(Value::Null)`.
    pub async fn get(&self, store: &str, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.runner
            .run(store, TransactionMode::ReadOnly, |s| s.get(key))
            .await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, store: &str, key: impl Into<Key>) -> Result<Option<T>> {
        let value = self.get(store, key).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Every entry of `store` in key order
    pub async fn get_all(&self, store: &str) -> Result<Vec<(Key, Value)>> {
        self.runner
            .run(store, TransactionMode::ReadOnly, |s| async move {
                Retrieval::probe(&s).entries(&s).await
            })
            .await
    }

    /// Removes `key` if present; deleting a missing key still succeeds
    pub async fn delete(&self, store: &str, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        tracing::debug!(store = %store, key = %key, "Delete");

        self.runner
            .run(store, TransactionMode::ReadWrite, |s| s.delete(key))
            .await?;
        Ok(true)
    }

    /// Every key of `store`, in the same order as [`Storage::get_all`]
    pub async fn keys(&self, store: &str) -> Result<Vec<Key>> {
        self.runner
            .run(store, TransactionMode::ReadOnly, |s| async move {
                Retrieval::probe(&s).keys(&s).await
            })
            .await
    }

    pub async fn clear(&self, store: &str) -> Result<bool> {
        tracing::debug!(store = %store, "Clear");
        self.runner
            .run(store, TransactionMode::ReadWrite, |s| s.clear())
            .await?;
        Ok(true)
    }

    pub fn close(&self) {
        self.connections.close();
    }
}
