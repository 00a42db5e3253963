//! Database handles and their signals

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::transaction::{Transaction, TransactionMode};
use crate::Result;

/// Payload of a version-change signal. `new_version` is `None` when the
/// database is being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    pub old_version: u32,
    pub new_version: Option<u32>,
}

type VersionChangeListener = Arc<dyn Fn(&VersionChange) + Send + Sync>;
type CloseListener = Arc<dyn Fn() + Send + Sync>;

/// State shared by every handle opened on the same database name
pub(crate) struct DatabaseShared {
    /// Serialises open, upgrade and delete for this name
    pub gate: tokio::sync::Mutex<()>,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    handles: Mutex<Vec<Weak<HandleInner>>>,
}

impl DatabaseShared {
    pub fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            locks: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn lock_for(&self, store: &str) -> Arc<RwLock<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(store.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Wait for every transaction on `stores` to finish and hold them off
    pub async fn lock_exclusive<'a>(
        &self,
        stores: impl IntoIterator<Item = &'a String>,
    ) -> Vec<OwnedRwLockWriteGuard<()>> {
        let mut names: Vec<&String> = stores.into_iter().collect();
        names.sort();

        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock_for(name).write_owned().await);
        }
        guards
    }

    pub fn register(&self, handle: &Arc<HandleInner>) {
        self.handles.lock().push(Arc::downgrade(handle));
    }

    fn open_handles(&self) -> Vec<Arc<HandleInner>> {
        let mut handles = self.handles.lock();
        handles.retain(|weak| weak.upgrade().is_some_and(|h| !h.is_closed()));
        handles.iter().filter_map(Weak::upgrade).collect()
    }

    /// Signal every open handle, then force-close the ones that stayed open
    pub fn notify_version_change(&self, change: VersionChange) {
        let handles = self.open_handles();
        for handle in &handles {
            handle.fire_version_change(&change);
        }
        for handle in &handles {
            if handle.force_close() {
                tracing::warn!(
                    handle = handle.id,
                    database = %handle.name,
                    "Handle ignored version change; forced closed"
                );
            }
        }
    }

    pub fn force_close_all(&self) -> usize {
        self.open_handles()
            .iter()
            .filter(|handle| handle.force_close())
            .count()
    }
}

pub(crate) struct HandleInner {
    pub id: u64,
    pub name: String,
    pub version: u32,
    pub stores: BTreeSet<String>,
    closed: AtomicBool,
    forced: AtomicBool,
    version_listeners: Mutex<Vec<VersionChangeListener>>,
    close_listeners: Mutex<Vec<CloseListener>>,
    pub shared: Arc<DatabaseShared>,
    pub engine: Arc<EngineInner>,
}

impl HandleInner {
    pub fn new(
        id: u64,
        name: &str,
        version: u32,
        stores: BTreeSet<String>,
        shared: Arc<DatabaseShared>,
        engine: Arc<EngineInner>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            version,
            stores,
            closed: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            version_listeners: Mutex::new(Vec::new()),
            close_listeners: Mutex::new(Vec::new()),
            shared,
            engine,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closed from outside; transactions still running on it abort
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    fn fire_version_change(&self, change: &VersionChange) {
        let listeners = self.version_listeners.lock().clone();
        for listener in listeners {
            listener(change);
        }
    }

    /// Returns false when the handle was already closed
    fn force_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.forced.store(true, Ordering::SeqCst);

        let listeners = self.close_listeners.lock().clone();
        for listener in listeners {
            listener();
        }
        true
    }
}

/// An open connection to one database.
///
/// Cloning yields another reference to the same connection, not a new one.
#[derive(Clone)]
pub struct DatabaseHandle {
    inner: Arc<HandleInner>,
}

impl DatabaseHandle {
    pub(crate) fn new(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn store_names(&self) -> Vec<String> {
        self.inner.stores.iter().cloned().collect()
    }

    pub fn contains_store(&self, name: &str) -> bool {
        self.inner.stores.contains(name)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close without signalling. Transactions already created run to completion.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(handle = self.inner.id, database = %self.inner.name, "Closed database handle");
        }
    }

    /// Called when another open or delete needs this database at a new version
    pub fn on_version_change<F>(&self, listener: F)
    where
        F: Fn(&VersionChange) + Send + Sync + 'static,
    {
        self.inner.version_listeners.lock().push(Arc::new(listener));
    }

    /// Called when the handle is closed from outside
    pub fn on_close<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.close_listeners.lock().push(Arc::new(listener));
    }

    /// Start a transaction over `stores`.
    ///
    /// Must be called from within a tokio runtime: the transaction is driven
    /// by its own task, which waits for the store locks before running
    /// queued requests.
    pub fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<Transaction> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }

        let mut scope: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        scope.sort();
        scope.dedup();

        if scope.is_empty() {
            return Err(EngineError::EmptyScope);
        }
        if let Some(missing) = scope.iter().find(|s| !self.inner.stores.contains(*s)) {
            return Err(EngineError::StoreNotFound(missing.clone()));
        }

        Ok(Transaction::begin(Arc::clone(&self.inner), scope, mode))
    }
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}
