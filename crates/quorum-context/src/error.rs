use std::path::PathBuf;

use quorum_store::StoreError;
use quorum_types::QuorumError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("embedding failed (retryable={retryable}): {message}")]
    Embedding { retryable: bool, message: String },

    #[error("chunking failed: {0}")]
    Chunking(String),

    #[error("path {0} is outside the project root")]
    OutsideRoot(PathBuf),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<ContextError> for QuorumError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Store(store) => store.into(),
            ContextError::Io(io) => QuorumError::IoTransient(io.to_string()),
            ContextError::Watch(watch) => QuorumError::IoFatal(watch.to_string()),
            ContextError::Embedding { retryable, message } => {
                if retryable {
                    QuorumError::IoTransient(message)
                } else {
                    QuorumError::IoFatal(message)
                }
            }
            ContextError::Chunking(message) => QuorumError::Validation(message),
            ContextError::OutsideRoot(path) => {
                QuorumError::Validation(format!("path {} outside root", path.display()))
            }
            ContextError::Cancelled => QuorumError::Cancelled,
        }
    }
}

pub type ContextResult<T> = Result<T, ContextError>;
