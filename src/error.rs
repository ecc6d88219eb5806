//! Error taxonomy for the task pipeline and the face store.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A codec, model or extraction adapter failed. Recorded as task `error`.
    #[error("adapter failure: {0}")]
    AdapterFailure(String),

    /// Missing record or embedding. Callers treat this as a soft result.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An archive build was requested while one is already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Reconciliation could not commit; the detection result was discarded.
    #[error("transaction failed: {0}")]
    TransactionFailure(#[source] rusqlite::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn adapter(err: impl std::fmt::Display) -> Self {
        Error::AdapterFailure(format!("{:#}", err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
