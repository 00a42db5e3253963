//! In-memory backend

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use super::{entry_len, Backend, Mutation, Schema};
use crate::error::EngineError;
use crate::key::Key;
use crate::overlay::StoreOverlay;
use crate::Result;

#[derive(Debug, Default)]
struct MemoryStore {
    entries: BTreeMap<Key, Value>,
    /// Sum of `entry_len` over `entries`
    bytes: u64,
}

#[derive(Debug, Default)]
struct MemoryDatabase {
    version: u32,
    stores: BTreeMap<String, MemoryStore>,
}

impl MemoryDatabase {
    fn used(&self) -> u64 {
        self.stores.values().map(|store| store.bytes).sum()
    }
}

/// Backend keeping every database in process memory.
///
/// Clones share the same data, so one backend can serve several engines.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    databases: Arc<RwLock<HashMap<String, MemoryDatabase>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_store<T>(
        &self,
        database: &str,
        store: &str,
        f: impl FnOnce(&BTreeMap<Key, Value>) -> T,
    ) -> Result<T> {
        let databases = self.databases.read();
        let entries = databases
            .get(database)
            .and_then(|db| db.stores.get(store))
            .ok_or_else(|| EngineError::StoreNotFound(store.to_string()))?;
        Ok(f(&entries.entries))
    }
}

impl Backend for MemoryBackend {
    fn schema(&self, database: &str) -> Result<Option<Schema>> {
        Ok(self.databases.read().get(database).map(|db| Schema {
            version: db.version,
            stores: db.stores.keys().cloned().collect(),
        }))
    }

    fn upgrade(&self, database: &str, version: u32, created: &[String]) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases.entry(database.to_string()).or_default();
        db.version = version;
        for store in created {
            db.stores.entry(store.clone()).or_default();
        }
        Ok(())
    }

    fn drop_database(&self, database: &str) -> Result<bool> {
        Ok(self.databases.write().remove(database).is_some())
    }

    fn get(&self, database: &str, store: &str, key: &Key) -> Result<Option<Value>> {
        self.with_store(database, store, |entries| entries.get(key).cloned())
    }

    fn next_after(
        &self,
        database: &str,
        store: &str,
        after: Option<&Key>,
    ) -> Result<Option<(Key, Value)>> {
        self.with_store(database, store, |entries| {
            let lower = match after {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            entries
                .range((lower, Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()))
        })
    }

    fn scan(&self, database: &str, store: &str) -> Result<Vec<(Key, Value)>> {
        self.with_store(database, store, |entries| {
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn commit(&self, database: &str, batch: &[Mutation], quota: Option<u64>) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .get_mut(database)
            .ok_or_else(|| EngineError::Backend(format!("Unknown database: {}", database)))?;

        // Net effect of the batch per store, in batch order
        let mut pending: BTreeMap<&str, StoreOverlay> = BTreeMap::new();
        for mutation in batch {
            let name = mutation.store();
            if !db.stores.contains_key(name) {
                return Err(EngineError::StoreNotFound(name.to_string()));
            }
            let overlay = pending.entry(name).or_default();
            match mutation {
                Mutation::Put { key, value, .. } => overlay.put(key.clone(), value.clone()),
                Mutation::Delete { key, .. } => overlay.delete(key.clone()),
                Mutation::Clear { .. } => overlay.clear(),
            }
        }

        if let Some(quota) = quota {
            let used = pending
                .iter()
                .filter_map(|(name, overlay)| db.stores.get(*name).map(|store| (store, overlay)))
                .fold(db.used(), |used, (store, overlay)| {
                    let (freed, added) = batch_delta(store, overlay);
                    (used + added).saturating_sub(freed)
                });
            if used > quota {
                return Err(EngineError::QuotaExceeded { used, quota });
            }
        }

        for (name, overlay) in pending {
            let Some(store) = db.stores.get_mut(name) else {
                continue;
            };
            let (cleared, writes) = overlay.into_parts();
            if cleared {
                store.entries.clear();
                store.bytes = 0;
            }
            for (key, value) in writes {
                if let Some(old) = store.entries.remove(&key) {
                    store.bytes = store.bytes.saturating_sub(entry_len(&key, &old));
                }
                if let Some(value) = value {
                    store.bytes += entry_len(&key, &value);
                    store.entries.insert(key, value);
                }
            }
        }
        Ok(())
    }
}

/// Bytes an overlay would free from and add to `store`
fn batch_delta(store: &MemoryStore, overlay: &StoreOverlay) -> (u64, u64) {
    let mut freed = if overlay.is_cleared() { store.bytes } else { 0 };
    let mut added = 0;
    for (key, value) in overlay.writes() {
        if !overlay.is_cleared() {
            if let Some(old) = store.entries.get(key) {
                freed += entry_len(key, old);
            }
        }
        if let Some(value) = value {
            added += entry_len(key, value);
        }
    }
    (freed, added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend_with_store() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend
            .upgrade("db", 1, &["items".to_string()])
            .unwrap();
        backend
    }

    #[test]
    fn test_commit_and_scan() {
        let backend = backend_with_store();
        backend
            .commit(
                "db",
                &[
                    Mutation::Put {
                        store: "items".to_string(),
                        key: Key::from("b"),
                        value: json!(2),
                    },
                    Mutation::Put {
                        store: "items".to_string(),
                        key: Key::from("a"),
                        value: json!(1),
                    },
                ],
                None,
            )
            .unwrap();

        let entries = backend.scan("db", "items").unwrap();
        assert_eq!(
            entries,
            vec![(Key::from("a"), json!(1)), (Key::from("b"), json!(2))]
        );

        let next = backend.next_after("db", "items", Some(&Key::from("a"))).unwrap();
        assert_eq!(next, Some((Key::from("b"), json!(2))));
        assert!(backend
            .next_after("db", "items", Some(&Key::from("b")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_quota_rejects_whole_batch() {
        let backend = backend_with_store();
        let result = backend.commit(
            "db",
            &[
                Mutation::Put {
                    store: "items".to_string(),
                    key: Key::from("small"),
                    value: json!(1),
                },
                Mutation::Put {
                    store: "items".to_string(),
                    key: Key::from("large"),
                    value: json!("x".repeat(64)),
                },
            ],
            Some(32),
        );

        assert!(matches!(result, Err(EngineError::QuotaExceeded { .. })));
        assert!(backend.scan("db", "items").unwrap().is_empty());
    }

    fn put(key: &str, value: Value) -> Mutation {
        Mutation::Put {
            store: "items".to_string(),
            key: Key::from(key),
            value,
        }
    }

    fn used(backend: &MemoryBackend) -> u64 {
        backend.databases.read()["db"].used()
    }

    #[test]
    fn test_quota_charges_net_change() {
        let backend = backend_with_store();
        let quota = Some(30);

        // "a" + 22 serialized bytes
        backend.commit("db", &[put("a", json!("x".repeat(20)))], quota).unwrap();
        assert_eq!(used(&backend), 23);

        // Overwriting frees the old value
        backend.commit("db", &[put("a", json!("y".repeat(20)))], quota).unwrap();
        assert_eq!(used(&backend), 23);

        let swap = [
            Mutation::Delete {
                store: "items".to_string(),
                key: Key::from("a"),
            },
            put("b", json!("z".repeat(20))),
        ];
        backend.commit("db", &swap, quota).unwrap();
        assert_eq!(used(&backend), 23);

        let refill = [
            Mutation::Clear {
                store: "items".to_string(),
            },
            put("c", json!(1)),
        ];
        backend.commit("db", &refill, quota).unwrap();
        assert_eq!(used(&backend), 2);
        assert_eq!(backend.scan("db", "items").unwrap(), vec![(Key::from("c"), json!(1))]);
    }

    #[test]
    fn test_unknown_store() {
        let backend = backend_with_store();
        let result = backend.get("db", "missing", &Key::from("a"));
        assert_eq!(result, Err(EngineError::StoreNotFound("missing".to_string())));
    }
}
