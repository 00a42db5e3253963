//! Object store handles, request futures and cursors

use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::key::Key;
use crate::transaction::{Command, Step, TransactionMode};
use crate::Result;

/// Optional features of the engine an object store may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub bulk_retrieval: bool,
}

/// Result of one request, delivered once the transaction has executed it.
///
/// The request is issued when it is created, not when it is first polled.
#[must_use = "requests are issued immediately; await them to observe the result"]
pub struct Request<T> {
    state: RequestState<T>,
}

enum RequestState<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Failed(Option<EngineError>),
}

impl<T> Request<T> {
    fn pending(reply: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: RequestState::Pending(reply),
        }
    }

    fn failed(err: EngineError) -> Self {
        Self {
            state: RequestState::Failed(Some(err)),
        }
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            // A dropped reply means the transaction finished before answering
            RequestState::Pending(reply) => Pin::new(reply)
                .poll(cx)
                .map(|answer| answer.unwrap_or(Err(EngineError::TransactionInactive))),
            RequestState::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or(EngineError::TransactionInactive))),
        }
    }
}

/// Handle to one store inside a transaction
#[derive(Clone)]
pub struct ObjectStore {
    name: String,
    mode: TransactionMode,
    commands: mpsc::UnboundedSender<Command>,
    capabilities: Capabilities,
}

impl ObjectStore {
    pub(crate) fn new(
        name: &str,
        mode: TransactionMode,
        commands: mpsc::UnboundedSender<Command>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            name: name.to_string(),
            mode,
            commands,
            capabilities,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Bulk reads, present only when the engine supports them
    pub fn bulk(&self) -> Option<BulkReader<'_>> {
        self.capabilities
            .bulk_retrieval
            .then_some(BulkReader { store: self })
    }

    /// Insert or overwrite
    pub fn put(&self, key: impl Into<Key>, value: Value) -> Request<()> {
        let key = key.into();
        self.write(|store, reply| Command::Put {
            store,
            key,
            value,
            overwrite: true,
            reply,
        })
    }

    /// Insert; a key that already exists fails the request and aborts the
    /// transaction
    pub fn add(&self, key: impl Into<Key>, value: Value) -> Request<()> {
        let key = key.into();
        self.write(|store, reply| Command::Put {
            store,
            key,
            value,
            overwrite: false,
            reply,
        })
    }

    pub fn get(&self, key: impl Into<Key>) -> Request<Option<Value>> {
        let key = key.into();
        self.send(|store, reply| Command::Get { store, key, reply })
    }

    /// Deleting a missing key succeeds
    pub fn delete(&self, key: impl Into<Key>) -> Request<()> {
        let key = key.into();
        self.write(|store, reply| Command::Delete { store, key, reply })
    }

    pub fn clear(&self) -> Request<()> {
        self.write(|store, reply| Command::Clear { store, reply })
    }

    /// Cursor over entries in natural key order; `None` for an empty store
    pub fn open_cursor(&self) -> CursorRequest<Cursor> {
        CursorRequest::new(self.clone(), None)
    }

    /// Like [`open_cursor`](Self::open_cursor) without loading values
    pub fn open_key_cursor(&self) -> CursorRequest<KeyCursor> {
        CursorRequest::new(self.clone(), None)
    }

    fn write(&self, build: impl FnOnce(String, oneshot::Sender<Result<()>>) -> Command) -> Request<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Request::failed(EngineError::ReadOnly);
        }
        self.send(build)
    }

    fn send<T>(
        &self,
        build: impl FnOnce(String, oneshot::Sender<Result<T>>) -> Command,
    ) -> Request<T> {
        let (reply, answer) = oneshot::channel();
        match self.commands.send(build(self.name.clone(), reply)) {
            Ok(()) => Request::pending(answer),
            Err(_) => Request::failed(EngineError::TransactionInactive),
        }
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Whole-store reads in a single request
pub struct BulkReader<'a> {
    store: &'a ObjectStore,
}

impl BulkReader<'_> {
    /// Every value, in natural key order
    pub fn get_all(&self) -> Request<Vec<Value>> {
        self.store
            .send(|store, reply| Command::GetAll { store, reply })
    }

    /// Every key, in natural key order
    pub fn get_all_keys(&self) -> Request<Vec<Key>> {
        self.store
            .send(|store, reply| Command::GetAllKeys { store, reply })
    }
}

/// Pending cursor step; resolves to the cursor at the next entry or `None`
/// once the store is exhausted
#[must_use = "cursor steps are issued immediately; await them to move the cursor"]
pub struct CursorRequest<C> {
    store: ObjectStore,
    step: Request<Option<Step>>,
    _kind: PhantomData<fn() -> C>,
}

impl<C: CursorKind> CursorRequest<C> {
    fn new(store: ObjectStore, after: Option<Key>) -> Self {
        let step = store.send(|name, reply| Command::Step {
            store: name,
            after,
            with_value: C::WITH_VALUES,
            reply,
        });
        Self {
            store,
            step,
            _kind: PhantomData,
        }
    }
}

impl<C: CursorKind> Future for CursorRequest<C> {
    type Output = Result<Option<C>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.step).poll(cx).map(|answer| {
            answer.map(|step| step.map(|step| C::from_step(this.store.clone(), step.key, step.value)))
        })
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Implemented by [`Cursor`] and [`KeyCursor`]
pub trait CursorKind: sealed::Sealed + Sized {
    #[doc(hidden)]
    const WITH_VALUES: bool;

    #[doc(hidden)]
    fn from_step(store: ObjectStore, key: Key, value: Option<Value>) -> Self;
}

/// Forward-only cursor positioned on one entry
#[derive(Debug)]
pub struct Cursor {
    store: ObjectStore,
    key: Key,
    value: Value,
}

impl Cursor {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Move to the first entry after this one. Consumes the cursor: a
    /// position is never revisited.
    pub fn advance(self) -> CursorRequest<Cursor> {
        CursorRequest::new(self.store, Some(self.key))
    }
}

impl sealed::Sealed for Cursor {}

impl CursorKind for Cursor {
    const WITH_VALUES: bool = true;

    fn from_step(store: ObjectStore, key: Key, value: Option<Value>) -> Self {
        Self {
            store,
            key,
            value: value.unwrap_or(Value::Null),
        }
    }
}

/// Forward-only cursor over keys only
#[derive(Debug)]
pub struct KeyCursor {
    store: ObjectStore,
    key: Key,
}

impl KeyCursor {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn advance(self) -> CursorRequest<KeyCursor> {
        CursorRequest::new(self.store, Some(self.key))
    }
}

impl sealed::Sealed for KeyCursor {}

impl CursorKind for KeyCursor {
    const WITH_VALUES: bool = false;

    fn from_step(store: ObjectStore, key: Key, _value: Option<Value>) -> Self {
        Self { store, key }
    }
}
