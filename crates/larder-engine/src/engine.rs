//! Engine entry point: open, upgrade, delete, force close

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, MemoryBackend};
use crate::database::{DatabaseHandle, DatabaseShared, HandleInner, VersionChange};
use crate::error::EngineError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Whether object stores expose `get_all` / `get_all_keys`
    pub bulk_retrieval: bool,
    /// Upper bound on stored bytes per database
    pub quota_bytes: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bulk_retrieval: true,
            quota_bytes: None,
        }
    }
}

pub(crate) struct EngineInner {
    pub backend: Arc<dyn Backend>,
    pub options: EngineOptions,
    databases: Mutex<HashMap<String, Arc<DatabaseShared>>>,
    next_id: AtomicU64,
    handshakes: AtomicU64,
    unhandled_errors: AtomicU64,
}

impl EngineInner {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_unhandled_error(&self) {
        self.unhandled_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn shared(&self, name: &str) -> Arc<DatabaseShared> {
        Arc::clone(
            self.databases
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DatabaseShared::new())),
        )
    }
}

/// Schema changes permitted while a database is being upgraded
#[derive(Debug)]
pub struct Upgrade {
    database: String,
    old_version: u32,
    new_version: u32,
    stores: BTreeSet<String>,
    created: Vec<String>,
}

impl Upgrade {
    pub fn database(&self) -> &str {
        &self.database
    }

    /// 0 for a database that did not exist
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    pub fn contains_store(&self, name: &str) -> bool {
        self.stores.contains(name)
    }

    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.stores.iter().map(String::as_str)
    }

    pub fn create_store(&mut self, name: &str) -> Result<()> {
        if !self.stores.insert(name.to_string()) {
            return Err(EngineError::StoreExists(name.to_string()));
        }
        self.created.push(name.to_string());
        Ok(())
    }
}

/// Entry point to a set of named databases over one backend.
///
/// Cloning is cheap and every clone sees the same databases, handles and
/// counters.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new<B: Backend>(backend: B, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend: Arc::new(backend),
                options,
                databases: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                handshakes: AtomicU64::new(0),
                unhandled_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new(), EngineOptions::default())
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Number of open requests that completed successfully
    pub fn open_handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::Relaxed)
    }

    /// Transaction errors nobody marked as handled
    pub fn unhandled_errors(&self) -> u64 {
        self.inner.unhandled_errors.load(Ordering::Relaxed)
    }

    /// Open `name` at `version`.
    ///
    /// A higher version than the stored one (or a database that does not
    /// exist yet) runs `on_upgrade`, the only place stores can be created.
    /// Other open handles on the database get a version-change signal first;
    /// those still open afterwards are closed by force, and the upgrade waits
    /// for their running transactions. If `on_upgrade` fails nothing is
    /// persisted.
    pub async fn open<F>(&self, name: &str, version: u32, on_upgrade: F) -> Result<DatabaseHandle>
    where
        F: FnOnce(&mut Upgrade) -> Result<()>,
    {
        if version == 0 {
            return Err(EngineError::InvalidVersion);
        }

        let shared = self.inner.shared(name);
        let _gate = shared.gate.lock().await;

        let schema = self.inner.backend.schema(name)?;
        let current = schema.as_ref().map_or(0, |s| s.version);

        if version < current {
            return Err(EngineError::Version {
                requested: version,
                current,
            });
        }

        if version > current {
            shared.notify_version_change(VersionChange {
                old_version: current,
                new_version: Some(version),
            });

            let existing = schema.map(|s| s.stores).unwrap_or_default();
            let _exclusive = shared.lock_exclusive(&existing).await;

            let mut upgrade = Upgrade {
                database: name.to_string(),
                old_version: current,
                new_version: version,
                stores: existing,
                created: Vec::new(),
            };
            on_upgrade(&mut upgrade).map_err(|e| EngineError::UpgradeAborted(e.to_string()))?;
            self.inner.backend.upgrade(name, version, &upgrade.created)?;

            tracing::info!(
                database = %name,
                old_version = current,
                new_version = version,
                created = ?upgrade.created,
                "Upgraded database"
            );
        }

        let schema = self
            .inner
            .backend
            .schema(name)?
            .ok_or_else(|| EngineError::Backend(format!("Schema missing for {}", name)))?;

        let handle = Arc::new(HandleInner::new(
            self.inner.next_id(),
            name,
            schema.version,
            schema.stores,
            Arc::clone(&shared),
            Arc::clone(&self.inner),
        ));
        shared.register(&handle);
        self.inner.handshakes.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(handle = handle.id, database = %name, version, "Opened database");

        Ok(DatabaseHandle::new(handle))
    }

    /// Delete `name` and all of its stores. Returns false if it did not exist.
    pub async fn delete_database(&self, name: &str) -> Result<bool> {
        let shared = self.inner.shared(name);
        let _gate = shared.gate.lock().await;

        let Some(schema) = self.inner.backend.schema(name)? else {
            return Ok(false);
        };

        shared.notify_version_change(VersionChange {
            old_version: schema.version,
            new_version: None,
        });
        let _exclusive = shared.lock_exclusive(&schema.stores).await;

        let removed = self.inner.backend.drop_database(name)?;
        tracing::info!(database = %name, "Deleted database");
        Ok(removed)
    }

    /// Close every open handle on `name` from outside, the way a storage
    /// engine does when its files go away. Returns how many were closed.
    pub fn force_close(&self, name: &str) -> usize {
        let closed = self.inner.shared(name).force_close_all();
        if closed > 0 {
            tracing::warn!(database = %name, handles = closed, "Force-closed database handles");
        }
        closed
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.inner.options)
            .field("open_handshakes", &self.open_handshakes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::transaction::TransactionMode;
    use std::sync::atomic::AtomicUsize;

    fn create_stores(stores: &'static [&'static str]) -> impl FnOnce(&mut Upgrade) -> Result<()> {
        move |upgrade| {
            for store in stores {
                if !upgrade.contains_store(store) {
                    upgrade.create_store(store)?;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_creates_stores_once() {
        let engine = Engine::in_memory();
        let upgrades = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&upgrades);
        let db = engine
            .open("db", 1, move |upgrade| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(upgrade.old_version(), 0);
                assert_eq!(upgrade.new_version(), 1);
                assert_eq!(upgrade.database(), "db");
                upgrade.create_store("items")
            })
            .await
            .unwrap();
        assert_eq!(db.store_names(), vec!["items".to_string()]);

        let counter = Arc::clone(&upgrades);
        let again = engine
            .open("db", 1, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(again.contains_store("items"));
        assert_eq!(upgrades.load(Ordering::SeqCst), 1);
        assert_eq!(engine.open_handshakes(), 2);
    }

    #[tokio::test]
    async fn test_version_rules() {
        let engine = Engine::in_memory();

        let result = engine.open("db", 0, create_stores(&["items"])).await;
        assert_eq!(result.unwrap_err(), EngineError::InvalidVersion);

        engine.open("db", 2, create_stores(&["items"])).await.unwrap();
        let result = engine.open("db", 1, create_stores(&["items"])).await;
        assert_eq!(
            result.unwrap_err(),
            EngineError::Version {
                requested: 1,
                current: 2
            }
        );
    }

    #[tokio::test]
    async fn test_failed_upgrade_persists_nothing() {
        let engine = Engine::in_memory();
        let previous = engine.open("db", 1, create_stores(&["items"])).await.unwrap();

        let result = engine
            .open("db", 2, |upgrade| {
                upgrade.create_store("tags")?;
                upgrade.create_store("items")
            })
            .await;
        assert!(matches!(result, Err(EngineError::UpgradeAborted(_))));
        // The version-change signal went out before the upgrade ran
        assert!(previous.is_closed());

        let db = engine.open("db", 1, create_stores(&[])).await.unwrap();
        assert_eq!(db.version(), 1);
        assert!(!db.contains_store("tags"));
    }

    #[tokio::test]
    async fn test_upgrade_signals_open_handles() {
        let engine = Engine::in_memory();
        let polite = engine.open("db", 1, create_stores(&["items"])).await.unwrap();
        let stubborn = engine.open("db", 1, create_stores(&["items"])).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handle = polite.clone();
        polite.on_version_change(move |change| {
            log.lock().push(*change);
            handle.close();
        });

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        stubborn.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let upgraded = engine.open("db", 2, create_stores(&["items", "tags"])).await.unwrap();

        assert_eq!(
            seen.lock().as_slice(),
            &[VersionChange {
                old_version: 1,
                new_version: Some(2)
            }]
        );
        assert!(polite.is_closed());
        assert!(stubborn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(upgraded.contains_store("tags"));
        assert_eq!(
            polite.transaction(&["items"], TransactionMode::ReadOnly).unwrap_err(),
            EngineError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_delete_database() {
        let engine = Engine::new(SqliteBackend::open_in_memory().unwrap(), EngineOptions::default());
        let db = engine.open("db", 3, create_stores(&["items"])).await.unwrap();

        let seen = Arc::new(Mutex::new(None));
        let log = Arc::clone(&seen);
        db.on_version_change(move |change| {
            *log.lock() = Some(*change);
        });

        assert!(engine.delete_database("db").await.unwrap());
        assert!(!engine.delete_database("db").await.unwrap());
        assert_eq!(
            *seen.lock(),
            Some(VersionChange {
                old_version: 3,
                new_version: None
            })
        );
        assert!(db.is_closed());

        let fresh = engine.open("db", 1, create_stores(&[])).await.unwrap();
        assert!(fresh.store_names().is_empty());
    }

    #[tokio::test]
    async fn test_force_close() {
        let engine = Engine::in_memory();
        let db = engine.open("db", 1, create_stores(&["items"])).await.unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        db.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(engine.force_close("db"), 1);
        assert_eq!(engine.force_close("db"), 0);
        assert!(db.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
