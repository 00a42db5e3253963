//! Transactions
//!
//! A transaction is created synchronously and driven by its own task. The
//! driver waits for the store locks (shared for read-only, exclusive for
//! read-write), then executes requests in the order they were issued.
//! Completion is only ever reported through the outcome signal:
//!
//! ```text
//! Active
//!   ↓ commit            ↓ abort / request error / commit failure / forced close
//! Committed           Aborted
//! ```

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::backend::Mutation;
use crate::database::HandleInner;
use crate::error::EngineError;
use crate::key::Key;
use crate::overlay::{StoreOverlay, StoreView};
use crate::store::{Capabilities, ObjectStore};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl TransactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
        }
    }
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// A request failed; its error is the transaction's error
    Request(EngineError),
    /// The backend rejected the batch at commit time
    Commit(EngineError),
    /// The connection was closed from outside while the transaction ran
    Closed,
    /// `abort()` was called, or every handle was dropped before `commit()`
    Explicit,
}

impl AbortReason {
    /// The error attached to the transaction, if any
    pub fn error(&self) -> Option<&EngineError> {
        match self {
            AbortReason::Request(err) | AbortReason::Commit(err) => Some(err),
            AbortReason::Closed | AbortReason::Explicit => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed,
    Aborted(AbortReason),
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

/// What a transaction error handler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The owner deals with the error; it goes no further
    Handled,
    /// Count and log the error as unhandled
    Propagate,
}

type ErrorHandler = Arc<dyn Fn(&EngineError) -> ErrorDisposition + Send + Sync>;

pub(crate) struct Step {
    pub key: Key,
    pub value: Option<Value>,
}

pub(crate) enum Command {
    Get {
        store: String,
        key: Key,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
    Put {
        store: String,
        key: Key,
        value: Value,
        overwrite: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        store: String,
        key: Key,
        reply: oneshot::Sender<Result<()>>,
    },
    Clear {
        store: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GetAll {
        store: String,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
    GetAllKeys {
        store: String,
        reply: oneshot::Sender<Result<Vec<Key>>>,
    },
    Step {
        store: String,
        after: Option<Key>,
        with_value: bool,
        reply: oneshot::Sender<Result<Option<Step>>>,
    },
    Commit,
    Abort,
}

impl Command {
    fn reject(self, err: EngineError) {
        // A dropped receiver just means nobody awaited the request
        match self {
            Command::Get { reply, .. } => drop(reply.send(Err(err))),
            Command::Put { reply, .. }
            | Command::Delete { reply, .. }
            | Command::Clear { reply, .. } => drop(reply.send(Err(err))),
            Command::GetAll { reply, .. } => drop(reply.send(Err(err))),
            Command::GetAllKeys { reply, .. } => drop(reply.send(Err(err))),
            Command::Step { reply, .. } => drop(reply.send(Err(err))),
            Command::Commit | Command::Abort => {}
        }
    }
}

/// Answer a request, handing back its error so the driver can abort
fn respond<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Option<EngineError> {
    let failure = result.as_ref().err().cloned();
    let _ = reply.send(result);
    failure
}

pub struct Transaction {
    id: u64,
    mode: TransactionMode,
    stores: Vec<String>,
    commands: mpsc::UnboundedSender<Command>,
    outcome: watch::Receiver<Option<TransactionOutcome>>,
    error_handler: Arc<Mutex<Option<ErrorHandler>>>,
    capabilities: Capabilities,
}

impl Transaction {
    pub(crate) fn begin(handle: Arc<HandleInner>, stores: Vec<String>, mode: TransactionMode) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let (signal, outcome) = watch::channel(None);
        let error_handler = Arc::new(Mutex::new(None));
        let id = handle.engine.next_id();
        let capabilities = Capabilities {
            bulk_retrieval: handle.engine.options.bulk_retrieval,
        };

        let driver = Driver {
            id,
            mode,
            stores: stores.clone(),
            handle,
            overlays: BTreeMap::new(),
            error_handler: Arc::clone(&error_handler),
        };
        tokio::spawn(driver.run(queue, signal));

        Self {
            id,
            mode,
            stores,
            commands,
            outcome,
            error_handler,
            capabilities,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn store_names(&self) -> &[String] {
        &self.stores
    }

    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        if !self.stores.iter().any(|s| s == name) {
            return Err(EngineError::StoreNotFound(name.to_string()));
        }
        Ok(ObjectStore::new(
            name,
            self.mode,
            self.commands.clone(),
            self.capabilities,
        ))
    }

    /// Receives the error of a failed request before the transaction aborts
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&EngineError) -> ErrorDisposition + Send + Sync + 'static,
    {
        *self.error_handler.lock() = Some(Arc::new(handler));
    }

    /// Commit once every request issued so far has run
    pub fn commit(&self) {
        let _ = self.commands.send(Command::Commit);
    }

    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort);
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.outcome.borrow().clone()
    }

    /// Resolves once the transaction is terminal
    pub fn done(&self) -> impl Future<Output = TransactionOutcome> + Send + 'static {
        let mut outcome = self.outcome.clone();
        async move {
            match outcome.wait_for(Option::is_some).await {
                Ok(state) => (*state)
                    .clone()
                    .unwrap_or(TransactionOutcome::Aborted(AbortReason::Explicit)),
                Err(_) => TransactionOutcome::Aborted(AbortReason::Explicit),
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("stores", &self.stores)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Store locks held for the lifetime of the driver
struct StoreLocks {
    _shared: Vec<OwnedRwLockReadGuard<()>>,
    _exclusive: Vec<OwnedRwLockWriteGuard<()>>,
}

struct Driver {
    id: u64,
    mode: TransactionMode,
    stores: Vec<String>,
    handle: Arc<HandleInner>,
    overlays: BTreeMap<String, StoreOverlay>,
    error_handler: Arc<Mutex<Option<ErrorHandler>>>,
}

impl Driver {
    async fn run(
        mut self,
        mut queue: mpsc::UnboundedReceiver<Command>,
        signal: watch::Sender<Option<TransactionOutcome>>,
    ) {
        let locks = self.acquire().await;
        tracing::debug!(
            transaction = self.id,
            database = %self.handle.name,
            mode = %self.mode,
            stores = ?self.stores,
            "Transaction started"
        );

        let outcome = self.drive(&mut queue).await;
        drop(locks);

        queue.close();
        while let Ok(command) = queue.try_recv() {
            command.reject(EngineError::TransactionInactive);
        }

        match &outcome {
            TransactionOutcome::Committed => {
                tracing::debug!(transaction = self.id, "Transaction committed");
            }
            TransactionOutcome::Aborted(reason) => {
                tracing::debug!(transaction = self.id, reason = ?reason, "Transaction aborted");
            }
        }
        signal.send_replace(Some(outcome));
    }

    async fn acquire(&self) -> StoreLocks {
        let mut locks = StoreLocks {
            _shared: Vec::new(),
            _exclusive: Vec::new(),
        };
        // Scope is sorted, so concurrent transactions lock in the same order
        for store in &self.stores {
            let lock = self.handle.shared.lock_for(store);
            match self.mode {
                TransactionMode::ReadOnly => locks._shared.push(lock.read_owned().await),
                TransactionMode::ReadWrite => locks._exclusive.push(lock.write_owned().await),
            }
        }
        locks
    }

    async fn drive(&mut self, queue: &mut mpsc::UnboundedReceiver<Command>) -> TransactionOutcome {
        while let Some(command) = queue.recv().await {
            if self.handle.is_forced() {
                command.reject(EngineError::ConnectionClosed);
                return TransactionOutcome::Aborted(AbortReason::Closed);
            }

            match command {
                Command::Commit => return self.commit(),
                Command::Abort => return TransactionOutcome::Aborted(AbortReason::Explicit),
                request => {
                    if let Some(err) = self.execute(request) {
                        self.raise(&err);
                        return TransactionOutcome::Aborted(AbortReason::Request(err));
                    }
                }
            }
        }

        TransactionOutcome::Aborted(AbortReason::Explicit)
    }

    fn view<'a>(&'a self, store: &'a str) -> StoreView<'a> {
        StoreView {
            backend: self.handle.engine.backend.as_ref(),
            database: &self.handle.name,
            store,
            overlay: self.overlays.get(store),
        }
    }

    fn execute(&mut self, command: Command) -> Option<EngineError> {
        match command {
            Command::Get { store, key, reply } => respond(reply, self.view(&store).get(&key)),
            Command::Put {
                store,
                key,
                value,
                overwrite,
                reply,
            } => {
                let result = self.put(store, key, value, overwrite);
                respond(reply, result)
            }
            Command::Delete { store, key, reply } => {
                self.overlays.entry(store).or_default().delete(key);
                respond(reply, Ok(()))
            }
            Command::Clear { store, reply } => {
                self.overlays.entry(store).or_default().clear();
                respond(reply, Ok(()))
            }
            Command::GetAll { store, reply } => {
                let result = self
                    .view(&store)
                    .scan()
                    .map(|entries| entries.into_iter().map(|(_, v)| v).collect());
                respond(reply, result)
            }
            Command::GetAllKeys { store, reply } => {
                let result = self
                    .view(&store)
                    .scan()
                    .map(|entries| entries.into_iter().map(|(k, _)| k).collect());
                respond(reply, result)
            }
            Command::Step {
                store,
                after,
                with_value,
                reply,
            } => {
                let result = self.view(&store).next_after(after.as_ref()).map(|entry| {
                    entry.map(|(key, value)| Step {
                        key,
                        value: with_value.then_some(value),
                    })
                });
                respond(reply, result)
            }
            Command::Commit | Command::Abort => None,
        }
    }

    fn put(&mut self, store: String, key: Key, value: Value, overwrite: bool) -> Result<()> {
        if !overwrite && self.view(&store).get(&key)?.is_some() {
            return Err(EngineError::Constraint { store, key });
        }
        self.overlays.entry(store).or_default().put(key, value);
        Ok(())
    }

    fn commit(&mut self) -> TransactionOutcome {
        if self.mode == TransactionMode::ReadOnly {
            return TransactionOutcome::Committed;
        }

        let batch: Vec<Mutation> = std::mem::take(&mut self.overlays)
            .into_iter()
            .filter(|(_, overlay)| !overlay.is_empty())
            .flat_map(|(store, overlay)| overlay.into_mutations(&store))
            .collect();
        if batch.is_empty() {
            return TransactionOutcome::Committed;
        }

        let engine = &self.handle.engine;
        match engine
            .backend
            .commit(&self.handle.name, &batch, engine.options.quota_bytes)
        {
            Ok(()) => TransactionOutcome::Committed,
            Err(err) => {
                tracing::warn!(transaction = self.id, error = %err, "Commit rejected");
                TransactionOutcome::Aborted(AbortReason::Commit(err))
            }
        }
    }

    /// Route a request error to the handler; unclaimed errors are counted
    fn raise(&self, err: &EngineError) {
        let handler = self.error_handler.lock().clone();
        let disposition = handler.map_or(ErrorDisposition::Propagate, |handler| handler(err));

        if disposition == ErrorDisposition::Propagate {
            self.handle.engine.record_unhandled_error();
            tracing::error!(
                transaction = self.id,
                database = %self.handle.name,
                error = %err,
                "Unhandled transaction error"
            );
        }
    }
}
