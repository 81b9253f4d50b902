use thiserror::Error;

/// Result type for collaborator operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Collaborator-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("revision conflict on scope {scope}: expected {expected}, found {actual}")]
    RevisionConflict {
        scope: String,
        expected: u64,
        actual: u64,
    },

    #[error("lock '{key}' not acquired within {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}
