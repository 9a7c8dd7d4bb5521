use thiserror::Error;

use crate::swap::{JobId, SwapState};

/// Errors returned by [`crate::swap::engine::ExecutionEngine`].
///
/// Protocol rejections and expiry are not errors here: they are persisted as
/// `Failed` / `Refunded` and reported through the outcome and the log sink.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("key derivation failed: {0}")]
    Key(String),

    #[error("job {job_id} cancelled in state {state}")]
    Cancelled { job_id: JobId, state: SwapState },

    #[error("job {job_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: SwapState,
        to: SwapState,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job store is closed")]
    Closed,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("decode job record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a failed call to the node or the exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network trouble, timeouts, temporary unavailability. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// The remote understood the request and refused it.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn rejected(err: impl std::fmt::Display) -> Self {
        Self::Rejected(err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
