//! Larder Core
//!
//! Configuration, logging and the bootstrap that turns a [`Config`] into a
//! ready [`Storage`].

mod bootstrap;
mod config;
mod error;

pub use bootstrap::{build_engine, open};
pub use config::{BackendConfig, Config};
pub use error::CoreError;

// Re-export the facade and the engine surface it exposes
pub use larder_engine::{Engine, EngineError, EngineOptions, Key, MemoryBackend, SqliteBackend};
pub use larder_storage::{
    Connection, ConnectionManager, ConnectionState, Retrieval, Storage, StorageError,
    TransactionMode, TransactionRunner,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
