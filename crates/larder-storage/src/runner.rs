//! Transaction settlement
//!
//! Runs one unit of work inside a single-store transaction and resolves only
//! once the transaction is terminal, so a successful result always means the
//! writes are durable.

use larder_engine::{
    AbortReason, EngineError, ErrorDisposition, ObjectStore, TransactionMode, TransactionOutcome,
};
use std::future::Future;

use crate::connection::ConnectionManager;
use crate::error::StorageError;
use crate::Result;

#[derive(Clone)]
pub struct TransactionRunner {
    connections: ConnectionManager,
}

impl TransactionRunner {
    pub fn new(connections: ConnectionManager) -> Self {
        Self { connections }
    }

    /// Run `work` against `store` in a fresh transaction.
    ///
    /// The transaction commits when `work` succeeds and aborts when it fails.
    /// Errors map as follows: a failed request yields
    /// [`StorageError::Request`], a failed commit or a connection closed
    /// underneath yields [`StorageError::TransactionAborted`] with the cause,
    /// and any other failure of `work` is reported as a request error.
    pub async fn run<T, F, Fut>(&self, store: &str, mode: TransactionMode, work: F) -> Result<T>
    where
        F: FnOnce(ObjectStore) -> Fut,
        Fut: Future<Output = std::result::Result<T, EngineError>>,
    {
        let connection = self.connections.current()?;
        let transaction = connection
            .handle()
            .transaction(&[store], mode)
            .map_err(|err| match err {
                EngineError::ConnectionClosed => StorageError::NotOpen,
                source => StorageError::Request {
                    store: store.to_string(),
                    source,
                },
            })?;

        // Failures are reported through the settled outcome instead
        let id = transaction.id();
        transaction.set_error_handler(move |err| {
            tracing::debug!(transaction = id, error = %err, "Request failed");
            ErrorDisposition::Handled
        });

        let done = transaction.done();
        let object_store = transaction
            .object_store(store)
            .map_err(|source| StorageError::Request {
                store: store.to_string(),
                source,
            })?;

        let result = work(object_store).await;
        match &result {
            Ok(_) => transaction.commit(),
            Err(_) => transaction.abort(),
        }

        let outcome = done.await;
        settle(store, result, outcome)
    }
}

fn settle<T>(
    store: &str,
    result: std::result::Result<T, EngineError>,
    outcome: TransactionOutcome,
) -> Result<T> {
    let store = store.to_string();
    match (outcome, result) {
        (TransactionOutcome::Committed, Ok(value)) => Ok(value),
        (TransactionOutcome::Committed, Err(source)) => Err(StorageError::Request { store, source }),
        (TransactionOutcome::Aborted(AbortReason::Request(source)), _) => {
            Err(StorageError::Request { store, source })
        }
        (TransactionOutcome::Aborted(AbortReason::Commit(cause)), _) => {
            Err(StorageError::TransactionAborted {
                store,
                cause: Some(cause),
            })
        }
        (TransactionOutcome::Aborted(AbortReason::Closed), _) => {
            Err(StorageError::TransactionAborted {
                store,
                cause: Some(EngineError::ConnectionClosed),
            })
        }
        (TransactionOutcome::Aborted(AbortReason::Explicit), Err(source)) => {
            Err(StorageError::Request { store, source })
        }
        (TransactionOutcome::Aborted(AbortReason::Explicit), Ok(_)) => {
            Err(StorageError::TransactionAborted { store, cause: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_engine::{Engine, EngineOptions, MemoryBackend};
    use serde_json::json;

    async fn runner_for(engine: Engine) -> TransactionRunner {
        let connections = ConnectionManager::new(engine);
        connections
            .open_database("db", &["items"], 1)
            .await
            .unwrap();
        TransactionRunner::new(connections)
    }

    #[tokio::test]
    async fn test_requires_open_connection() {
        let runner = TransactionRunner::new(ConnectionManager::new(Engine::in_memory()));
        let err = runner
            .run("items", TransactionMode::ReadOnly, |store| store.get("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotOpen));
    }

    #[tokio::test]
    async fn test_result_resolves_after_commit() {
        let engine = Engine::in_memory();
        let runner = runner_for(engine.clone()).await;

        runner
            .run("items", TransactionMode::ReadWrite, |store| {
                store.put("k", json!({"n": 1}))
            })
            .await
            .unwrap();

        let value = runner
            .run("items", TransactionMode::ReadOnly, |store| store.get("k"))
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"n": 1})));
        assert_eq!(engine.unhandled_errors(), 0);
    }

    #[tokio::test]
    async fn test_failed_request_is_handled_and_rejected() {
        let engine = Engine::in_memory();
        let runner = runner_for(engine.clone()).await;

        runner
            .run("items", TransactionMode::ReadWrite, |store| store.put("k", json!(1)))
            .await
            .unwrap();

        let err = runner
            .run("items", TransactionMode::ReadWrite, |store| async move {
                store.put("other", json!(2)).await?;
                store.add("k", json!(3)).await
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::Request {
                source: EngineError::Constraint { .. },
                ..
            }
        ));
        assert_eq!(engine.unhandled_errors(), 0);

        let other = runner
            .run("items", TransactionMode::ReadOnly, |store| store.get("other"))
            .await
            .unwrap();
        assert_eq!(other, None);
    }

    #[tokio::test]
    async fn test_commit_failure_maps_to_abort() {
        let options = EngineOptions {
            bulk_retrieval: true,
            quota_bytes: Some(16),
        };
        let runner = runner_for(Engine::new(MemoryBackend::new(), options)).await;

        let err = runner
            .run("items", TransactionMode::ReadWrite, |store| {
                store.put("big", json!("a value far larger than the quota allows"))
            })
            .await
            .unwrap_err();

        match err {
            StorageError::TransactionAborted { store, cause } => {
                assert_eq!(store, "items");
                assert!(matches!(cause, Some(EngineError::QuotaExceeded { .. })));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_store_is_request_error() {
        let runner = runner_for(Engine::in_memory()).await;
        let err = runner
            .run("missing", TransactionMode::ReadOnly, |store| store.get("k"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Request {
                source: EngineError::StoreNotFound(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_forced_close_mid_transaction_aborts() {
        let engine = Engine::in_memory();
        let runner = runner_for(engine.clone()).await;

        let err = runner
            .run("items", TransactionMode::ReadWrite, |store| {
                let engine = engine.clone();
                async move {
                    store.put("k", json!(1)).await?;
                    engine.force_close("db");
                    store.put("j", json!(2)).await
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::TransactionAborted {
                cause: Some(EngineError::ConnectionClosed),
                ..
            }
        ));
        let err = runner
            .run("items", TransactionMode::ReadOnly, |store| store.get("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotOpen));
    }

    #[test]
    fn test_settle_without_error_is_generic_abort() {
        let result: std::result::Result<(), EngineError> = Ok(());
        let err = settle(
            "items",
            result,
            TransactionOutcome::Aborted(AbortReason::Explicit),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::TransactionAborted { cause: None, .. }
        ));
    }
}
