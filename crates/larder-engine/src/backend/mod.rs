//! Persistence backends
//!
//! The engine owns transactions, locking and signalling. A backend only has
//! to answer reads and apply a committed batch atomically.

mod memory;
mod migrations;
mod sqlite;

use serde_json::Value;
use std::collections::BTreeSet;

use crate::key::Key;
use crate::Result;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Persisted shape of one database
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub version: u32,
    pub stores: BTreeSet<String>,
}

/// A single write inside a committed batch
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put { store: String, key: Key, value: Value },
    Delete { store: String, key: Key },
    Clear { store: String },
}

impl Mutation {
    pub fn store(&self) -> &str {
        match self {
            Mutation::Put { store, .. } | Mutation::Delete { store, .. } | Mutation::Clear { store } => {
                store
            }
        }
    }
}

/// Durable storage underneath the engine.
///
/// Calls are synchronous. Conflicting access is already serialised by the
/// engine's per-store locks; `commit` must apply the whole batch or nothing,
/// and must reject it when the resulting database size exceeds `quota`.
pub trait Backend: Send + Sync + 'static {
    fn schema(&self, database: &str) -> Result<Option<Schema>>;

    /// Record a new version, creating `created` stores
    fn upgrade(&self, database: &str, version: u32, created: &[String]) -> Result<()>;

    fn drop_database(&self, database: &str) -> Result<bool>;

    fn get(&self, database: &str, store: &str, key: &Key) -> Result<Option<Value>>;

    /// First entry whose key is strictly greater than `after`
    fn next_after(
        &self,
        database: &str,
        store: &str,
        after: Option<&Key>,
    ) -> Result<Option<(Key, Value)>>;

    /// All entries in natural key order
    fn scan(&self, database: &str, store: &str) -> Result<Vec<(Key, Value)>>;

    fn commit(&self, database: &str, batch: &[Mutation], quota: Option<u64>) -> Result<()>;
}

/// Bytes charged against the quota for one entry
pub(crate) fn entry_len(key: &Key, value: &Value) -> u64 {
    key.stored_len() + value.to_string().len() as u64
}
