// Consensus Module
// Runs the ordered strategy chain over a task's proposals and records the
// resulting decision, including token-savings accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use quorum_store::DecisionRepo;
use quorum_types::{new_id, Decision, Proposal, ProposalRef, QuorumResult};

use crate::manager::ProposalManager;
use crate::strategy::{ConsensusStrategy, Evaluation, StrategyKind};

/// One entry in the strategy trail: what ran and how it went.
#[derive(Debug, Clone)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub agreed: bool,
    pub detail: String,
}

/// What a consensus run produced.
#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    pub agreed: bool,
    pub reason: String,
    pub winner_proposal_id: Option<String>,
    pub decision_id: String,
    pub strategy: Option<StrategyKind>,
    pub trail: Vec<StrategyAttempt>,
}

pub const DEFAULT_STRATEGY_ORDER: [StrategyKind; 3] = [
    StrategyKind::Voting,
    StrategyKind::ReasoningQuality,
    StrategyKind::Custom,
];

pub struct ConsensusModule {
    manager: ProposalManager,
    decisions: DecisionRepo,
    strategies: HashMap<StrategyKind, Arc<dyn ConsensusStrategy>>,
}

impl ConsensusModule {
    pub fn new(manager: ProposalManager, decisions: DecisionRepo) -> Self {
        Self {
            manager,
            decisions,
            strategies: HashMap::new(),
        }
    }

    /// Register an implementation for its discriminator, replacing any
    /// previous registration.
    pub fn register(&mut self, strategy: Arc<dyn ConsensusStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn manager(&self) -> &ProposalManager {
        &self.manager
    }

    /// Decide consensus for a task.
    ///
    /// Waits up to `wait_for` for a first proposal, loads all proposals in
    /// insertion order, and walks the strategy chain until one agrees. A
    /// strategy that fails is recorded in the trail and the chain continues.
    /// The decision is persisted whether or not agreement was reached.
    pub async fn decide(
        &self,
        task_id: &str,
        strategy_order: Option<Vec<StrategyKind>>,
        wait_for: Option<Duration>,
    ) -> QuorumResult<ConsensusOutcome> {
        if let Some(wait) = wait_for {
            if !wait.is_zero() {
                self.manager.wait_for(task_id, wait).await?;
            }
        }

        let proposals = self.manager.proposals_for_task(task_id).await?;
        if proposals.is_empty() {
            let decision_id = self
                .persist_decision(task_id, &proposals, None, None, "No proposals", &[])
                .await?;
            return Ok(ConsensusOutcome {
                agreed: false,
                reason: "No proposals".to_string(),
                winner_proposal_id: None,
                decision_id,
                strategy: None,
                trail: Vec::new(),
            });
        }

        let order = dedup_order(
            strategy_order.unwrap_or_else(|| DEFAULT_STRATEGY_ORDER.to_vec()),
        );

        let mut trail: Vec<StrategyAttempt> = Vec::new();
        let mut winning: Option<(StrategyKind, Evaluation)> = None;
        let mut last_reason = "no strategy reached agreement".to_string();

        for kind in order {
            let Some(strategy) = self.strategies.get(&kind) else {
                trail.push(StrategyAttempt {
                    strategy: kind,
                    agreed: false,
                    detail: "strategy not registered".to_string(),
                });
                continue;
            };
            match strategy.evaluate(&proposals) {
                Ok(evaluation) => {
                    trail.push(StrategyAttempt {
                        strategy: kind,
                        agreed: evaluation.agreed,
                        detail: evaluation.reason.clone(),
                    });
                    last_reason = evaluation.reason.clone();
                    if evaluation.agreed {
                        winning = Some((kind, evaluation));
                        break;
                    }
                }
                Err(err) => {
                    // A failing strategy never aborts the chain.
                    tracing::warn!(
                        target: "quorum.consensus",
                        task_id,
                        strategy = kind.as_str(),
                        "consensus strategy failed: {err}"
                    );
                    trail.push(StrategyAttempt {
                        strategy: kind,
                        agreed: false,
                        detail: format!("strategy error: {err}"),
                    });
                    last_reason = format!("strategy {} failed", kind.as_str());
                }
            }
        }

        let (strategy, evaluation) = match &winning {
            Some((kind, evaluation)) => (Some(*kind), Some(evaluation)),
            None => (None, None),
        };
        let winner = evaluation.and_then(|e| e.winner_proposal_id.clone());
        let agreement_rate = evaluation.and_then(|e| e.agreement_rate);
        let reason = evaluation
            .map(|e| e.reason.clone())
            .unwrap_or(last_reason);

        let decision_id = self
            .persist_decision(
                task_id,
                &proposals,
                winner.as_deref(),
                agreement_rate,
                &reason,
                &trail,
            )
            .await?;

        Ok(ConsensusOutcome {
            agreed: winning.is_some(),
            reason,
            winner_proposal_id: winner,
            decision_id,
            strategy,
            trail,
        })
    }

    async fn persist_decision(
        &self,
        task_id: &str,
        proposals: &[Proposal],
        winner: Option<&str>,
        agreement_rate: Option<f64>,
        rationale: &str,
        trail: &[StrategyAttempt],
    ) -> QuorumResult<String> {
        let considered: Vec<ProposalRef> = proposals
            .iter()
            .map(|p| ProposalRef {
                proposal_id: p.id.clone(),
                agent_id: p.agent_id.clone(),
                tokens: p.token_usage.total(),
            })
            .collect();
        let selected: Vec<String> = winner.map(|w| vec![w.to_string()]).unwrap_or_default();

        let trail_json: Vec<serde_json::Value> = trail
            .iter()
            .map(|attempt| {
                json!({
                    "strategy": attempt.strategy.as_str(),
                    "agreed": attempt.agreed,
                    "detail": attempt.detail,
                })
            })
            .collect();

        let mut decision = Decision {
            id: new_id(),
            task_id: task_id.to_string(),
            considered,
            selected,
            winner_proposal_id: winner.map(String::from),
            agreement_rate,
            rationale: Some(rationale.to_string()),
            consensus_achieved: winner.is_some(),
            decided_at: Utc::now(),
            metadata: None,
        };
        decision.metadata = Some(json!({
            "trail": trail_json,
            "token_savings_absolute": decision.token_savings_absolute(),
            "token_savings_percent": decision.token_savings_percent(),
        }));
        decision.validate()?;
        self.decisions.upsert(&decision).await?;
        Ok(decision.id)
    }
}

fn dedup_order(order: Vec<StrategyKind>) -> Vec<StrategyKind> {
    let mut seen = Vec::new();
    for kind in order {
        if !seen.contains(&kind) {
            seen.push(kind);
        }
    }
    seen
}
