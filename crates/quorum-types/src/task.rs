use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QuorumError, QuorumResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Implementation,
    Architecture,
    Review,
    Research,
    Testing,
    Documentation,
    Planning,
    Bugfix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    WaitingInput,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::WaitingInput => "waiting_input",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Solo,
    Consensus,
    Sequential,
    Parallel,
}

impl RoutingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingStrategy::Solo => "solo",
            RoutingStrategy::Consensus => "consensus",
            RoutingStrategy::Sequential => "sequential",
            RoutingStrategy::Parallel => "parallel",
        }
    }
}

/// A unit of user-submitted work dispatched to one or more agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub routing: RoutingStrategy,
    #[serde(default)]
    pub assignee_ids: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub complexity: u8,
    pub risk: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            task_type,
            status: TaskStatus::Pending,
            routing: RoutingStrategy::Solo,
            assignee_ids: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            complexity: 5,
            risk: 5,
            created_at: Utc::now(),
            updated_at: None,
            due_at: None,
            metadata: None,
        }
    }

    /// Check the task invariants before it enters the engine.
    pub fn validate(&self) -> QuorumResult<()> {
        if self.id.trim().is_empty() {
            return Err(QuorumError::Validation("task id must not be blank".into()));
        }
        if self.title.trim().is_empty() {
            return Err(QuorumError::Validation(format!(
                "task {} has a blank title",
                self.id
            )));
        }
        if self.dependencies.contains(&self.id) {
            return Err(QuorumError::Validation(format!(
                "task {} depends on itself",
                self.id
            )));
        }
        if !(1..=10).contains(&self.complexity) {
            return Err(QuorumError::Validation(format!(
                "task {} complexity {} outside 1..=10",
                self.id, self.complexity
            )));
        }
        if !(1..=10).contains(&self.risk) {
            return Err(QuorumError::Validation(format!(
                "task {} risk {} outside 1..=10",
                self.id, self.risk
            )));
        }
        if let Some(updated) = self.updated_at {
            if updated < self.created_at {
                return Err(QuorumError::Validation(format!(
                    "task {} updated_at precedes created_at",
                    self.id
                )));
            }
        }
        if let Some(due) = self.due_at {
            if due < self.created_at {
                return Err(QuorumError::Validation(format!(
                    "task {} due_at precedes created_at",
                    self.id
                )));
            }
        }
        Ok(())
    }
}
