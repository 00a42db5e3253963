//! Larder Storage Layer
//!
//! Future-based key-value operations over the engine. One manager owns the
//! connection; every operation runs in its own transaction and resolves only
//! once that transaction has committed or aborted.

mod connection;
mod error;
mod fallback;
mod operations;
mod runner;

pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use error::StorageError;
pub use fallback::Retrieval;
pub use operations::Storage;
pub use runner::TransactionRunner;

pub use larder_engine::{Key, TransactionMode};

pub type Result<T> = std::result::Result<T, StorageError>;
