use quorum_types::QuorumError;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed row: {0}")]
    InvalidRow(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Busy/locked failures may be retried within the current transaction;
    /// everything else is surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<StoreError> for QuorumError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            QuorumError::IoTransient(err.to_string())
        } else {
            QuorumError::IoFatal(err.to_string())
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
