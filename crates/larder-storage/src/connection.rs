//! Connection lifecycle
//!
//! The manager holds at most one live connection. Opening is idempotent for
//! the same name and version, concurrent opens collapse into one handshake,
//! and a connection invalidated from outside is dropped so the next
//! operation reports [`StorageError::NotOpen`].

use chrono::{DateTime, Utc};
use larder_engine::{DatabaseHandle, Engine, EngineError};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::error::StorageError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Closed by the manager or by the engine
    Closed,
    /// Another open needed a newer version
    Invalidated,
}

/// An open database handle plus the bookkeeping the manager needs
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    opened_at: DateTime<Utc>,
    handle: DatabaseHandle,
    state: RwLock<ConnectionState>,
}

impl Connection {
    fn new(handle: DatabaseHandle) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                opened_at: Utc::now(),
                handle,
                state: RwLock::new(ConnectionState::Open),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    pub fn version(&self) -> u32 {
        self.inner.handle.version()
    }

    pub fn store_names(&self) -> Vec<String> {
        self.inner.handle.store_names()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.inner.handle.is_closed()
    }

    pub(crate) fn handle(&self) -> &DatabaseHandle {
        &self.inner.handle
    }

    fn transition(&self, state: ConnectionState) {
        *self.inner.state.write() = state;
        self.inner.handle.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

type Slot = Arc<RwLock<Option<Connection>>>;

/// Owns the single live connection
pub struct ConnectionManager {
    engine: Engine,
    current: Slot,
    /// Held across the handshake so concurrent opens wait for the first
    opening: Arc<tokio::sync::Mutex<()>>,
}

impl ConnectionManager {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            current: Arc::new(RwLock::new(None)),
            opening: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Open `name` at `version`, creating any of `stores` that do not exist
    /// yet during the upgrade.
    ///
    /// Returns the cached connection when it is still open for the same name
    /// and version. Opening another name replaces (and closes) the current
    /// connection. A failed open leaves the previous connection in place,
    /// except that an upgrade of the same database signals it first, so a
    /// failure past that point still leaves it invalidated.
    pub async fn open_database<S: AsRef<str>>(
        &self,
        name: &str,
        stores: &[S],
        version: u32,
    ) -> Result<Connection> {
        let requested: Vec<String> = stores.iter().map(|s| s.as_ref().to_string()).collect();

        if let Some(connection) = self.reusable(name, &requested, version)? {
            return Ok(connection);
        }

        let _opening = self.opening.lock().await;
        if let Some(connection) = self.reusable(name, &requested, version)? {
            tracing::debug!(database = %name, "Joined in-flight open");
            return Ok(connection);
        }

        let handle = self
            .engine
            .open(name, version, |upgrade| {
                for store in &requested {
                    if !upgrade.contains_store(store) {
                        upgrade.create_store(store)?;
                    }
                }
                Ok(())
            })
            .await
            .map_err(|source| StorageError::Connection {
                name: name.to_string(),
                source,
            })?;

        if let Some(missing) = requested.iter().find(|s| !handle.contains_store(s)) {
            handle.close();
            return Err(StorageError::Connection {
                name: name.to_string(),
                source: EngineError::StoreNotFound(missing.clone()),
            });
        }

        let connection = Connection::new(handle);
        self.watch(&connection);

        let previous = self.current.write().replace(connection.clone());
        if let Some(previous) = previous {
            if previous.is_open() {
                previous.transition(ConnectionState::Closed);
                tracing::debug!(connection = %previous.id(), database = %previous.name(), "Replaced connection");
            }
        }

        tracing::info!(
            connection = %connection.id(),
            database = %name,
            version,
            "Opened database"
        );
        Ok(connection)
    }

    /// The live connection, or [`StorageError::NotOpen`]
    pub fn current(&self) -> Result<Connection> {
        match self.current.read().as_ref() {
            Some(connection) if connection.is_open() => Ok(connection.clone()),
            _ => Err(StorageError::NotOpen),
        }
    }

    pub fn is_open(&self) -> bool {
        self.current().is_ok()
    }

    /// Close the current connection, if any. Transactions already running
    /// finish normally.
    pub fn close(&self) {
        if let Some(connection) = self.current.write().take() {
            connection.transition(ConnectionState::Closed);
            tracing::info!(connection = %connection.id(), database = %connection.name(), "Closed database");
        }
    }

    fn reusable(&self, name: &str, requested: &[String], version: u32) -> Result<Option<Connection>> {
        let current = self.current.read();
        let Some(connection) = current
            .as_ref()
            .filter(|c| c.is_open() && c.name() == name && c.version() == version)
        else {
            return Ok(None);
        };

        if let Some(missing) = requested.iter().find(|s| !connection.handle().contains_store(s)) {
            return Err(StorageError::Connection {
                name: name.to_string(),
                source: EngineError::StoreNotFound(missing.clone()),
            });
        }
        Ok(Some(connection.clone()))
    }

    fn watch(&self, connection: &Connection) {
        let slot = Arc::downgrade(&self.current);
        let weak = Arc::downgrade(&connection.inner);
        connection.handle().on_version_change(move |change| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let connection = Connection { inner };
            connection.transition(ConnectionState::Invalidated);
            release(&slot, &connection);
            tracing::warn!(
                connection = %connection.id(),
                database = %connection.name(),
                old_version = change.old_version,
                new_version = ?change.new_version,
                "Connection invalidated by version change"
            );
        });

        let slot = Arc::downgrade(&self.current);
        let weak = Arc::downgrade(&connection.inner);
        connection.handle().on_close(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let connection = Connection { inner };
            *connection.inner.state.write() = ConnectionState::Closed;
            release(&slot, &connection);
            tracing::warn!(
                connection = %connection.id(),
                database = %connection.name(),
                "Connection closed by the engine"
            );
        });
    }
}

/// Forget `connection` if it is still the current one
fn release(slot: &Weak<RwLock<Option<Connection>>>, connection: &Connection) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut current = slot.write();
    if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
        *current = None;
    }
}

impl Clone for ConnectionManager {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            current: Arc::clone(&self.current),
            opening: Arc::clone(&self.opening),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let engine = Engine::in_memory();
        let manager = ConnectionManager::new(engine.clone());

        let before = chrono::Utc::now();
        let first = manager.open_database("db", &["items"], 1).await.unwrap();
        let second = manager.open_database("db", &["items"], 1).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.opened_at(), second.opened_at());
        assert!(first.opened_at() >= before);
        assert_eq!(engine.open_handshakes(), 1);
        assert_eq!(first.store_names(), vec!["items".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_handshake() {
        let engine = Engine::in_memory();
        let manager = ConnectionManager::new(engine.clone());

        let (a, b) = tokio::join!(
            manager.open_database("db", &["items"], 1),
            manager.open_database("db", &["items"], 1)
        );

        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(engine.open_handshakes(), 1);
    }

    #[tokio::test]
    async fn test_current_requires_open() {
        let manager = ConnectionManager::new(Engine::in_memory());
        assert!(matches!(manager.current(), Err(StorageError::NotOpen)));

        manager.open_database("db", &["items"], 1).await.unwrap();
        assert!(manager.is_open());

        manager.close();
        assert!(matches!(manager.current(), Err(StorageError::NotOpen)));
    }

    #[tokio::test]
    async fn test_other_name_replaces_connection() {
        let manager = ConnectionManager::new(Engine::in_memory());

        let first = manager.open_database("one", &["items"], 1).await.unwrap();
        let second = manager.open_database("two", &["items"], 1).await.unwrap();

        assert_eq!(first.state(), ConnectionState::Closed);
        assert!(second.is_open());
        assert_eq!(manager.current().unwrap().name(), "two");
    }

    #[tokio::test]
    async fn test_failed_open_keeps_previous_connection() {
        let manager = ConnectionManager::new(Engine::in_memory());
        manager.open_database("db", &["items"], 2).await.unwrap();

        let other = ConnectionManager::new(manager.engine().clone());
        let err = other.open_database("db", &["items"], 1).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Connection {
                source: EngineError::Version { requested: 1, current: 2 },
                ..
            }
        ));

        let err = manager.open_database("db", &["items"], 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Connection { .. }));
        assert_eq!(manager.current().unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_missing_store_without_upgrade_fails() {
        let engine = Engine::in_memory();
        let manager = ConnectionManager::new(engine.clone());
        manager.open_database("db", &["items"], 1).await.unwrap();
        manager.close();

        let err = manager
            .open_database("db", &["items", "extra"], 1)
            .await
            .unwrap_err();
        match err {
            StorageError::Connection { name, source } => {
                assert_eq!(name, "db");
                assert_eq!(source, EngineError::StoreNotFound("extra".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!manager.is_open());
    }

    #[tokio::test]
    async fn test_version_change_invalidates_connection() {
        let engine = Engine::in_memory();
        let manager = ConnectionManager::new(engine.clone());
        let first = manager.open_database("db", &["items"], 1).await.unwrap();

        let elsewhere = ConnectionManager::new(engine);
        elsewhere
            .open_database("db", &["items", "extra"], 2)
            .await
            .unwrap();

        assert_eq!(first.state(), ConnectionState::Invalidated);
        assert!(matches!(manager.current(), Err(StorageError::NotOpen)));
        assert!(elsewhere.is_open());
    }

    #[tokio::test]
    async fn test_forced_close_clears_current() {
        let engine = Engine::in_memory();
        let manager = ConnectionManager::new(engine.clone());
        manager.open_database("db", &["items"], 1).await.unwrap();

        assert_eq!(engine.force_close("db"), 1);
        assert!(matches!(manager.current(), Err(StorageError::NotOpen)));

        let reopened = manager.open_database("db", &["items"], 1).await.unwrap();
        assert!(reopened.is_open());
        assert_eq!(engine.open_handshakes(), 2);
    }
}
