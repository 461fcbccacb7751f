use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{RoutingStrategy, TaskStatus};

/// Stable error classification carried on results and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    ConcurrentExecution,
    InvalidTransition,
    NoWorkflowForStrategy,
    AgentUnavailable,
    ConsensusStrategyFailed,
    IoTransient,
    IoFatal,
    IndexingPerFile,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConcurrentExecution => "concurrent_execution",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::NoWorkflowForStrategy => "no_workflow_for_strategy",
            ErrorKind::AgentUnavailable => "agent_unavailable",
            ErrorKind::ConsensusStrategyFailed => "consensus_strategy_failed",
            ErrorKind::IoTransient => "io_transient",
            ErrorKind::IoFatal => "io_fatal",
            ErrorKind::IndexingPerFile => "indexing_per_file",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Domain error taxonomy. Every variant maps to exactly one [`ErrorKind`]
/// so presentation layers can surface a stable kind + message + ids shape.
#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task {0} is already executing")]
    ConcurrentExecution(String),

    #[error("invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("no workflow registered for strategy {0:?}")]
    NoWorkflowForStrategy(RoutingStrategy),

    #[error("agent {0} is unavailable")]
    AgentUnavailable(String),

    #[error("consensus strategy {strategy} failed: {message}")]
    ConsensusStrategyFailed { strategy: String, message: String },

    #[error("transient io failure: {0}")]
    IoTransient(String),

    #[error("fatal io failure: {0}")]
    IoFatal(String),

    #[error("indexing failed for {path}: {message}")]
    IndexingPerFile { path: String, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl QuorumError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuorumError::Validation(_) => ErrorKind::Validation,
            QuorumError::NotFound(_) => ErrorKind::NotFound,
            QuorumError::ConcurrentExecution(_) => ErrorKind::ConcurrentExecution,
            QuorumError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            QuorumError::NoWorkflowForStrategy(_) => ErrorKind::NoWorkflowForStrategy,
            QuorumError::AgentUnavailable(_) => ErrorKind::AgentUnavailable,
            QuorumError::ConsensusStrategyFailed { .. } => ErrorKind::ConsensusStrategyFailed,
            QuorumError::IoTransient(_) => ErrorKind::IoTransient,
            QuorumError::IoFatal(_) => ErrorKind::IoFatal,
            QuorumError::IndexingPerFile { .. } => ErrorKind::IndexingPerFile,
            QuorumError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuorumError::AgentUnavailable(_) | QuorumError::IoTransient(_)
        )
    }
}

pub type QuorumResult<T> = Result<T, QuorumError>;
