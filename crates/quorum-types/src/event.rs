use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;
use crate::error::ErrorKind;
use crate::task::{RoutingStrategy, TaskStatus};

/// Closed set of lifecycle events published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    TaskCreated {
        task_id: String,
        title: String,
    },
    TaskCompleted {
        task_id: String,
        status: TaskStatus,
    },
    AgentStatusChanged {
        agent_id: String,
        status: AgentStatus,
    },
    ProposalSubmitted {
        task_id: String,
        proposal_id: String,
        agent_id: String,
    },
    WorkflowStarted {
        task_id: String,
        strategy: RoutingStrategy,
    },
    WorkflowCompleted {
        task_id: String,
        strategy: RoutingStrategy,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
    },
}

/// Discriminator used by filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskCompleted,
    AgentStatusChanged,
    ProposalSubmitted,
    WorkflowStarted,
    WorkflowCompleted,
}

impl OrchestrationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OrchestrationEvent::TaskCreated { .. } => EventKind::TaskCreated,
            OrchestrationEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            OrchestrationEvent::AgentStatusChanged { .. } => EventKind::AgentStatusChanged,
            OrchestrationEvent::ProposalSubmitted { .. } => EventKind::ProposalSubmitted,
            OrchestrationEvent::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            OrchestrationEvent::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
        }
    }

    /// Task id the event concerns, when it concerns one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::TaskCreated { task_id, .. }
            | OrchestrationEvent::TaskCompleted { task_id, .. }
            | OrchestrationEvent::ProposalSubmitted { task_id, .. }
            | OrchestrationEvent::WorkflowStarted { task_id, .. }
            | OrchestrationEvent::WorkflowCompleted { task_id, .. } => Some(task_id),
            OrchestrationEvent::AgentStatusChanged { .. } => None,
        }
    }
}
