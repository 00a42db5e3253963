//! Larder Engine
//!
//! Transactional key-value database organised as named databases holding
//! named object stores. Opening is versioned, store creation only happens in
//! the upgrade phase, and every read or write runs inside a transaction whose
//! completion is reported through signals rather than return values.
//!
//! Persistence is pluggable through [`Backend`]: [`MemoryBackend`] for tests
//! and ephemeral use, [`SqliteBackend`] for on-disk storage.

mod backend;
mod database;
mod engine;
mod error;
mod key;
mod overlay;
mod store;
mod transaction;

pub use backend::{Backend, MemoryBackend, Mutation, Schema, SqliteBackend};
pub use database::{DatabaseHandle, VersionChange};
pub use engine::{Engine, EngineOptions, Upgrade};
pub use error::EngineError;
pub use key::Key;
pub use store::{
    BulkReader, Capabilities, Cursor, CursorKind, CursorRequest, KeyCursor, ObjectStore, Request,
};
pub use transaction::{
    AbortReason, ErrorDisposition, Transaction, TransactionMode, TransactionOutcome,
};

pub type Result<T> = std::result::Result<T, EngineError>;
