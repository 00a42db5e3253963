//! Whole-store retrieval with and without bulk support
//!
//! Engines that answer "all values" and "all keys" in one request take the
//! bulk path; the rest are walked with a cursor. Both return entries in the
//! store's natural key order.

use futures_util::future::try_join;
use larder_engine::{EngineError, Key, ObjectStore};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieval {
    Bulk,
    Cursor,
}

impl Retrieval {
    /// Pick the strategy the engine behind `store` supports
    pub fn probe(store: &ObjectStore) -> Self {
        if store.bulk().is_some() {
            Retrieval::Bulk
        } else {
            Retrieval::Cursor
        }
    }

    /// Every entry in key order. Falls back to the cursor walk when bulk is
    /// requested but not available.
    pub async fn entries(self, store: &ObjectStore) -> Result<Vec<(Key, Value)>, EngineError> {
        match (self, store.bulk()) {
            (Retrieval::Bulk, Some(bulk)) => {
                let (keys, values) = try_join(bulk.get_all_keys(), bulk.get_all()).await?;
                Ok(keys.into_iter().zip(values).collect())
            }
            _ => walk_entries(store).await,
        }
    }

    pub async fn keys(self, store: &ObjectStore) -> Result<Vec<Key>, EngineError> {
        match (self, store.bulk()) {
            (Retrieval::Bulk, Some(bulk)) => bulk.get_all_keys().await,
            _ => walk_keys(store).await,
        }
    }
}

async fn walk_entries(store: &ObjectStore) -> Result<Vec<(Key, Value)>, EngineError> {
    let mut entries = Vec::new();
    let mut next = store.open_cursor().await?;
    while let Some(cursor) = next {
        entries.push((cursor.key().clone(), cursor.value().clone()));
        next = cursor.advance().await?;
    }
    Ok(entries)
}

async fn walk_keys(store: &ObjectStore) -> Result<Vec<Key>, EngineError> {
    let mut keys = Vec::new();
    let mut next = store.open_key_cursor().await?;
    while let Some(cursor) = next {
        keys.push(cursor.key().clone());
        next = cursor.advance().await?;
    }
    Ok(keys)
}
