use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use quorum_types::TaskStatus;

/// One applied transition in a task's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Whether `from -> to` appears in the transition table.
pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Failed)
            | (InProgress, WaitingInput)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (WaitingInput, InProgress)
            | (WaitingInput, Failed)
    )
}

/// Validated task status transitions with per-task, append-only history.
///
/// A single lock over the history map makes transitions linearizable per
/// task: concurrent callers serialize, and the history of any one task is a
/// totally ordered path through the table.
pub struct StateMachine {
    history: Mutex<HashMap<String, Vec<TransitionRecord>>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a transition. Returns `true` and appends to history when the
    /// table allows it; returns `false` and mutates nothing otherwise.
    pub fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        metadata: Option<Value>,
    ) -> bool {
        if !is_allowed(from, to) {
            tracing::debug!(
                target: "quorum.state",
                task_id,
                from = from.as_str(),
                to = to.as_str(),
                "rejected transition"
            );
            return false;
        }
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history
            .entry(task_id.to_string())
            .or_default()
            .push(TransitionRecord {
                from,
                to,
                at: Utc::now(),
                metadata,
            });
        true
    }

    pub fn history(&self, task_id: &str) -> Vec<TransitionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Status after the last applied transition, if any.
    pub fn current(&self, task_id: &str) -> Option<TaskStatus> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .and_then(|records| records.last())
            .map(|record| record.to)
    }

    pub fn clear_history(&self, task_id: &str) {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task_id);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn table_matches_lifecycle() {
        assert!(is_allowed(Pending, InProgress));
        assert!(is_allowed(Pending, Failed));
        assert!(is_allowed(InProgress, WaitingInput));
        assert!(is_allowed(InProgress, Completed));
        assert!(is_allowed(WaitingInput, InProgress));
        assert!(!is_allowed(Pending, Completed));
        assert!(!is_allowed(WaitingInput, Completed));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for to in [Pending, InProgress, WaitingInput, Completed, Failed] {
            assert!(!is_allowed(Completed, to));
            assert!(!is_allowed(Failed, to));
        }
    }

    #[test]
    fn invalid_transition_leaves_history_untouched() {
        let machine = StateMachine::new();
        assert!(machine.transition("t1", Pending, InProgress, None));
        assert!(!machine.transition("t1", Pending, Completed, None));

        let history = machine.history("t1");
        assert_eq!(history.len(), 1);
        assert_eq!(machine.current("t1"), Some(InProgress));
    }

    #[test]
    fn history_is_a_path_through_the_table() {
        let machine = StateMachine::new();
        machine.transition("t1", Pending, InProgress, None);
        machine.transition("t1", InProgress, WaitingInput, None);
        machine.transition("t1", WaitingInput, InProgress, None);
        machine.transition("t1", InProgress, Completed, None);

        let history = machine.history("t1");
        assert_eq!(history.len(), 4);
        for pair in history.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
        for record in &history {
            assert!(is_allowed(record.from, record.to));
        }
    }

    #[test]
    fn clear_history_forgets_the_task() {
        let machine = StateMachine::new();
        machine.transition("t1", Pending, InProgress, None);
        machine.clear_history("t1");
        assert!(machine.history("t1").is_empty());
        assert_eq!(machine.current("t1"), None);
    }
}
