// Routing Module
// Maps a task plus parsed user hints to a strategy and a participant set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use quorum_core::AgentRegistry;
use quorum_types::{
    AgentDefinition, AgentStatus, QuorumError, QuorumResult, RoutingStrategy, Task, TaskType,
    UserDirective,
};

/// Hints below this confidence are ignored.
pub const DIRECTIVE_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Keyword classifier result over (title, description).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClassification {
    pub suggested_type: TaskType,
    pub matched_keywords: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: String,
    pub strategy: RoutingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_agent_id: Option<String>,
    pub participant_agent_ids: Vec<String>,
    pub directive: UserDirective,
    pub classification: TaskClassification,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

const KEYWORD_TABLE: &[(&str, TaskType)] = &[
    ("implement", TaskType::Implementation),
    ("build", TaskType::Implementation),
    ("add", TaskType::Implementation),
    ("design", TaskType::Architecture),
    ("architecture", TaskType::Architecture),
    ("refactor", TaskType::Architecture),
    ("review", TaskType::Review),
    ("audit", TaskType::Review),
    ("research", TaskType::Research),
    ("investigate", TaskType::Research),
    ("explore", TaskType::Research),
    ("test", TaskType::Testing),
    ("verify", TaskType::Testing),
    ("document", TaskType::Documentation),
    ("docs", TaskType::Documentation),
    ("plan", TaskType::Planning),
    ("roadmap", TaskType::Planning),
    ("fix", TaskType::Bugfix),
    ("bug", TaskType::Bugfix),
    ("crash", TaskType::Bugfix),
];

/// Classify free text into a task type by keyword hits. Falls back to the
/// task's declared type with low confidence when nothing matches.
pub fn classify(title: &str, description: Option<&str>, declared: TaskType) -> TaskClassification {
    let haystack = format!("{} {}", title, description.unwrap_or("")).to_lowercase();
    let mut matched: Vec<(String, TaskType)> = Vec::new();
    for (keyword, task_type) in KEYWORD_TABLE {
        if haystack.contains(keyword) {
            matched.push((keyword.to_string(), *task_type));
        }
    }
    if matched.is_empty() {
        return TaskClassification {
            suggested_type: declared,
            matched_keywords: Vec::new(),
            confidence: 0.25,
        };
    }
    // Majority vote over matched keywords; first match breaks ties.
    let mut best = (matched[0].1, 0usize);
    for (_, candidate) in &matched {
        let count = matched.iter().filter(|(_, t)| t == candidate).count();
        if count > best.1 {
            best = (*candidate, count);
        }
    }
    let confidence = (0.5 + 0.1 * matched.len() as f64).min(0.95);
    TaskClassification {
        suggested_type: best.0,
        matched_keywords: matched.into_iter().map(|(k, _)| k).collect(),
        confidence,
    }
}

/// Routing policy over the agent fleet.
#[derive(Clone)]
pub struct Router {
    registry: AgentRegistry,
    confidence_threshold: f64,
}

impl Router {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            confidence_threshold: DIRECTIVE_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Produce a routing decision. Only ONLINE agents are eligible.
    pub fn route(&self, task: &Task, directive: &UserDirective) -> QuorumResult<RoutingDecision> {
        task.validate()?;

        let online: Vec<AgentDefinition> = self
            .registry
            .all()
            .into_iter()
            .filter(|agent| agent.status == AgentStatus::Online)
            .collect();
        if online.is_empty() {
            return Err(QuorumError::AgentUnavailable(
                "no agents are online".to_string(),
            ));
        }

        let classification =
            classify(&task.title, task.description.as_deref(), task.task_type);
        let (strategy, notes) = self.choose_strategy(task, directive, &classification, &online);
        let primary = self.choose_primary(task, directive, &online);
        let mut participants = self.choose_participants(strategy, &primary, directive, &online);

        // The primary always appears in the participant set.
        if let Some(primary_id) = &primary {
            if !participants.contains(primary_id) {
                participants.insert(0, primary_id.clone());
            }
        }

        Ok(RoutingDecision {
            task_id: task.id.clone(),
            strategy,
            primary_agent_id: primary,
            participant_agent_ids: participants,
            directive: directive.clone(),
            classification,
            decided_at: Utc::now(),
            notes,
            metadata: None,
        })
    }

    fn choose_strategy(
        &self,
        task: &Task,
        directive: &UserDirective,
        classification: &TaskClassification,
        online: &[AgentDefinition],
    ) -> (RoutingStrategy, Option<String>) {
        if directive.force_consensus
            && directive.force_consensus_confidence >= self.confidence_threshold
        {
            return (
                RoutingStrategy::Consensus,
                Some("consensus forced by directive".to_string()),
            );
        }
        if directive.prevent_consensus
            && directive.prevent_consensus_confidence >= self.confidence_threshold
        {
            return (
                RoutingStrategy::Solo,
                Some("consensus prevented by directive".to_string()),
            );
        }

        let effective_type = if classification.confidence >= self.confidence_threshold {
            classification.suggested_type
        } else {
            task.task_type
        };

        let multi_agent = online.len() > 1;
        let strategy = if multi_agent && (task.risk >= 7 || task.complexity >= 8) {
            RoutingStrategy::Consensus
        } else if multi_agent && effective_type == TaskType::Architecture {
            RoutingStrategy::Consensus
        } else if multi_agent
            && matches!(effective_type, TaskType::Research | TaskType::Review)
        {
            RoutingStrategy::Parallel
        } else if multi_agent && effective_type == TaskType::Planning && task.complexity >= 5 {
            RoutingStrategy::Sequential
        } else {
            RoutingStrategy::Solo
        };
        (strategy, None)
    }

    fn choose_primary(
        &self,
        task: &Task,
        directive: &UserDirective,
        online: &[AgentDefinition],
    ) -> Option<String> {
        if let Some(assigned) = &directive.assign_to_agent {
            if directive.assign_confidence >= self.confidence_threshold
                && online.iter().any(|agent| &agent.id == assigned)
            {
                return Some(assigned.clone());
            }
        }
        let capability = capability_for(task.task_type);
        online
            .iter()
            .max_by_key(|agent| agent.strength_for(capability))
            .map(|agent| agent.id.clone())
    }

    fn choose_participants(
        &self,
        strategy: RoutingStrategy,
        primary: &Option<String>,
        directive: &UserDirective,
        online: &[AgentDefinition],
    ) -> Vec<String> {
        if !directive.assigned_agents.is_empty() {
            let assigned: Vec<String> = directive
                .assigned_agents
                .iter()
                .filter(|id| online.iter().any(|agent| agent.id == **id))
                .cloned()
                .collect();
            if !assigned.is_empty() {
                return assigned;
            }
        }
        match strategy {
            RoutingStrategy::Solo => primary
                .clone()
                .map(|id| vec![id])
                .unwrap_or_else(|| online.first().map(|a| vec![a.id.clone()]).unwrap_or_default()),
            RoutingStrategy::Consensus
            | RoutingStrategy::Parallel
            | RoutingStrategy::Sequential => {
                online.iter().map(|agent| agent.id.clone()).collect()
            }
        }
    }
}

/// Capability an agent needs for a task type.
pub fn capability_for(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Implementation | TaskType::Bugfix => "code",
        TaskType::Architecture => "design",
        TaskType::Review => "review",
        TaskType::Research => "research",
        TaskType::Testing => "testing",
        TaskType::Documentation => "docs",
        TaskType::Planning => "planning",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        let mut a1 = AgentDefinition::new("a1", "coder", "Coder").with_capabilities(["code"]);
        a1.strengths.push(quorum_types::AgentStrength {
            capability: "code".to_string(),
            score: 90,
        });
        let a2 =
            AgentDefinition::new("a2", "reviewer", "Reviewer").with_capabilities(["review"]);
        let mut a3 =
            AgentDefinition::new("a3", "offline", "Offline").with_capabilities(["code"]);
        a3.status = AgentStatus::Offline;
        AgentRegistry::new(vec![a1, a2, a3])
    }

    fn task(task_type: TaskType) -> Task {
        Task::new("t1", "do the thing", task_type)
    }

    #[test]
    fn forced_consensus_wins() {
        let router = Router::new(registry());
        let decision = router
            .route(&task(TaskType::Implementation), &UserDirective::forcing_consensus(0.9))
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Consensus);
    }

    #[test]
    fn low_confidence_force_is_ignored() {
        let router = Router::new(registry());
        let decision = router
            .route(&task(TaskType::Implementation), &UserDirective::forcing_consensus(0.2))
            .unwrap();
        assert_ne!(decision.strategy, RoutingStrategy::Consensus);
    }

    #[test]
    fn prevent_consensus_routes_solo() {
        let router = Router::new(registry());
        let mut high_risk = task(TaskType::Implementation);
        high_risk.risk = 9;
        let decision = router
            .route(&high_risk, &UserDirective::preventing_consensus(0.9))
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Solo);
    }

    #[test]
    fn high_risk_tasks_get_consensus() {
        let router = Router::new(registry());
        let mut risky = task(TaskType::Implementation);
        risky.risk = 9;
        let decision = router.route(&risky, &UserDirective::default()).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Consensus);
    }

    #[test]
    fn offline_agents_are_not_routed() {
        let router = Router::new(registry());
        let decision = router
            .route(&task(TaskType::Implementation), &UserDirective::default())
            .unwrap();
        assert!(!decision.participant_agent_ids.contains(&"a3".to_string()));
    }

    #[test]
    fn assigned_agent_becomes_primary_and_participant() {
        let router = Router::new(registry());
        let decision = router
            .route(
                &task(TaskType::Implementation),
                &UserDirective::assigning("a2", 0.9),
            )
            .unwrap();
        assert_eq!(decision.primary_agent_id.as_deref(), Some("a2"));
        assert!(decision
            .participant_agent_ids
            .contains(&"a2".to_string()));
    }

    #[test]
    fn primary_is_always_a_participant() {
        let router = Router::new(registry());
        let decision = router
            .route(&task(TaskType::Research), &UserDirective::default())
            .unwrap();
        if let Some(primary) = &decision.primary_agent_id {
            assert!(decision.participant_agent_ids.contains(primary));
        }
    }

    #[test]
    fn no_online_agents_is_unavailable() {
        let mut offline =
            AgentDefinition::new("a1", "coder", "Coder").with_capabilities(["code"]);
        offline.status = AgentStatus::Offline;
        let router = Router::new(AgentRegistry::new(vec![offline]));
        let err = router
            .route(&task(TaskType::Implementation), &UserDirective::default())
            .unwrap_err();
        assert_eq!(err.kind(), quorum_types::ErrorKind::AgentUnavailable);
    }

    #[test]
    fn classifier_picks_up_keywords() {
        let classification = classify(
            "Fix the crash in the parser",
            Some("users report a bug"),
            TaskType::Implementation,
        );
        assert_eq!(classification.suggested_type, TaskType::Bugfix);
        assert!(classification.confidence > 0.5);
    }
}
