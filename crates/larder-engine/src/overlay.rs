//! Staged writes of a read-write transaction
//!
//! Reads inside the transaction see the overlay on top of the backend;
//! `into_mutations` turns it into the batch applied on commit.

use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::backend::{Backend, Mutation};
use crate::key::Key;
use crate::Result;

#[derive(Debug, Default)]
pub(crate) struct StoreOverlay {
    cleared: bool,
    /// `None` marks a deletion
    writes: BTreeMap<Key, Option<Value>>,
}

impl StoreOverlay {
    pub fn put(&mut self, key: Key, value: Value) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Key) {
        self.writes.insert(key, None);
    }

    pub fn clear(&mut self) {
        self.cleared = true;
        self.writes.clear();
    }

    pub fn is_empty(&self) -> bool {
        !self.cleared && self.writes.is_empty()
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    pub fn writes(&self) -> &BTreeMap<Key, Option<Value>> {
        &self.writes
    }

    pub fn into_parts(self) -> (bool, BTreeMap<Key, Option<Value>>) {
        (self.cleared, self.writes)
    }

    pub fn into_mutations(self, store: &str) -> Vec<Mutation> {
        let mut batch = Vec::with_capacity(self.writes.len() + 1);
        if self.cleared {
            batch.push(Mutation::Clear {
                store: store.to_string(),
            });
        }
        for (key, value) in self.writes {
            batch.push(match value {
                Some(value) => Mutation::Put {
                    store: store.to_string(),
                    key,
                    value,
                },
                None => Mutation::Delete {
                    store: store.to_string(),
                    key,
                },
            });
        }
        batch
    }
}

/// Backend contents of one store as seen through an optional overlay
pub(crate) struct StoreView<'a> {
    pub backend: &'a dyn Backend,
    pub database: &'a str,
    pub store: &'a str,
    pub overlay: Option<&'a StoreOverlay>,
}

impl StoreView<'_> {
    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        if let Some(overlay) = self.overlay {
            if let Some(staged) = overlay.writes.get(key) {
                return Ok(staged.clone());
            }
            if overlay.cleared {
                return Ok(None);
            }
        }
        self.backend.get(self.database, self.store, key)
    }

    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        let Some(overlay) = self.overlay else {
            return self.backend.scan(self.database, self.store);
        };

        let mut merged: BTreeMap<Key, Value> = if overlay.cleared {
            BTreeMap::new()
        } else {
            self.backend
                .scan(self.database, self.store)?
                .into_iter()
                .collect()
        };
        for (key, value) in &overlay.writes {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    pub fn next_after(&self, after: Option<&Key>) -> Result<Option<(Key, Value)>> {
        let Some(overlay) = self.overlay else {
            return self.backend.next_after(self.database, self.store, after);
        };

        // Next backend entry whose key the overlay does not shadow
        let mut from_backend = None;
        if !overlay.cleared {
            let mut cursor = after.cloned();
            while let Some((key, value)) =
                self.backend
                    .next_after(self.database, self.store, cursor.as_ref())?
            {
                if !overlay.writes.contains_key(&key) {
                    from_backend = Some((key, value));
                    break;
                }
                cursor = Some(key);
            }
        }

        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let from_overlay = overlay
            .writes
            .range((lower, Bound::Unbounded))
            .find_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())));

        Ok(match (from_backend, from_overlay) {
            (Some(b), Some(o)) => Some(if o.0 < b.0 { o } else { b }),
            (b, o) => b.or(o),
        })
    }
}
