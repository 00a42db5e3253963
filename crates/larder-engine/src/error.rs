//! Engine error types

use thiserror::Error;

use crate::key::Key;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Object store not found: {0}")]
    StoreNotFound(String),

    #[error("Object store already exists: {0}")]
    StoreExists(String),

    #[error("Key {key} already exists in store {store}")]
    Constraint { store: String, key: Key },

    #[error("Requested version {requested} is less than the existing version {current}")]
    Version { requested: u32, current: u32 },

    #[error("Database version must be at least 1")]
    InvalidVersion,

    #[error("Quota exceeded: {used} bytes used, {quota} allowed")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("Transaction scope must name at least one store")]
    EmptyScope,

    #[error("Transaction is not active")]
    TransactionInactive,

    #[error("Transaction is read-only")]
    ReadOnly,

    #[error("Database connection is closed")]
    ConnectionClosed,

    #[error("Upgrade aborted: {0}")]
    UpgradeAborted(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
