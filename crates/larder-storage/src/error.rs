//! Storage error types

use larder_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database not opened. Call init first.")]
    NotOpen,

    #[error("Failed to open database {name}: {source}")]
    Connection {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("Transaction on {store} aborted: {}", describe_abort(.cause))]
    TransactionAborted {
        store: String,
        cause: Option<EngineError>,
    },

    #[error("Request on {store} failed: {source}")]
    Request {
        store: String,
        #[source]
        source: EngineError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn describe_abort(cause: &Option<EngineError>) -> String {
    match cause {
        Some(err) => err.to_string(),
        None => "AbortError".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_without_cause_is_generic() {
        let err = StorageError::TransactionAborted {
            store: "items".to_string(),
            cause: None,
        };
        assert_eq!(err.to_string(), "Transaction on items aborted: AbortError");
    }
}
