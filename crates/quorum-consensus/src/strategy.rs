// Consensus Strategies
// Each strategy is a pure evaluation over the collected proposals. The
// module runs them in order and stops at the first that reaches agreement.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use quorum_core::QualityRubric;
use quorum_types::{Proposal, QuorumResult};

pub const DEFAULT_VOTING_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Voting,
    ReasoningQuality,
    Custom,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Voting => "voting",
            StrategyKind::ReasoningQuality => "reasoning_quality",
            StrategyKind::Custom => "custom",
        }
    }
}

/// Outcome of one strategy evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub agreed: bool,
    pub winner_proposal_id: Option<String>,
    pub agreement_rate: Option<f64>,
    pub reason: String,
}

impl Evaluation {
    fn disagreed(reason: impl Into<String>, rate: Option<f64>) -> Self {
        Self {
            agreed: false,
            winner_proposal_id: None,
            agreement_rate: rate,
            reason: reason.into(),
        }
    }
}

pub trait ConsensusStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn evaluate(&self, proposals: &[Proposal]) -> QuorumResult<Evaluation>;
}

/// Deterministic winner pick within a candidate set: highest confidence,
/// ties broken by earliest creation, then smallest id.
fn pick_winner<'a>(candidates: impl Iterator<Item = &'a Proposal>) -> Option<&'a Proposal> {
    candidates.min_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Supermajority on structural content equality.
pub struct VotingStrategy {
    threshold: f64,
}

impl VotingStrategy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for VotingStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_VOTING_THRESHOLD)
    }
}

impl ConsensusStrategy for VotingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Voting
    }

    fn evaluate(&self, proposals: &[Proposal]) -> QuorumResult<Evaluation> {
        if proposals.is_empty() {
            return Ok(Evaluation::disagreed("no proposals to vote on", None));
        }

        // Group by structural equality of content.
        let mut groups: Vec<(&Value, Vec<&Proposal>)> = Vec::new();
        for proposal in proposals {
            match groups.iter_mut().find(|(content, _)| *content == &proposal.content) {
                Some((_, members)) => members.push(proposal),
                None => groups.push((&proposal.content, vec![proposal])),
            }
        }

        let top_size = groups.iter().map(|(_, m)| m.len()).max().unwrap_or(0);
        let tied_at_top = groups.iter().filter(|(_, m)| m.len() == top_size).count() > 1;
        let share = top_size as f64 / proposals.len() as f64;

        if share < self.threshold {
            return Ok(Evaluation::disagreed(
                format!(
                    "largest group share {share:.2} below threshold {:.2}",
                    self.threshold
                ),
                Some(share),
            ));
        }
        if tied_at_top {
            return Ok(Evaluation::disagreed("Tie detected at the top", Some(share)));
        }

        let winners = groups
            .iter()
            .find(|(_, m)| m.len() == top_size)
            .map(|(_, m)| m.as_slice())
            .unwrap_or(&[]);
        let winner = pick_winner(winners.iter().copied());
        Ok(Evaluation {
            agreed: true,
            winner_proposal_id: winner.map(|p| p.id.clone()),
            agreement_rate: Some(share),
            reason: format!(
                "{top_size}/{} proposals agree on the same content",
                proposals.len()
            ),
        })
    }
}

/// Rubric-scored fallback: rewards longer, structured reasoning weighted by
/// the agent's own confidence.
pub struct ReasoningQualityStrategy {
    rubric: QualityRubric,
}

const STRUCTURED_FIELDS: &[&str] = &["steps", "pros", "cons", "risks"];
const LENGTH_SATURATION: f64 = 1000.0;

impl ReasoningQualityStrategy {
    pub fn new(rubric: QualityRubric) -> Self {
        Self { rubric }
    }

    fn score(&self, proposal: &Proposal) -> f64 {
        let text = proposal.content.to_string();
        let length_score = (text.len() as f64 / LENGTH_SATURATION).min(1.0);
        let structure_score = match proposal.content.as_object() {
            Some(map) => {
                let present = STRUCTURED_FIELDS
                    .iter()
                    .filter(|field| map.contains_key(**field))
                    .count();
                present as f64 / STRUCTURED_FIELDS.len() as f64
            }
            None => 0.0,
        };
        self.rubric.length_weight * length_score
            + self.rubric.structure_weight * structure_score
            + self.rubric.confidence_weight * proposal.confidence
    }
}

impl Default for ReasoningQualityStrategy {
    fn default() -> Self {
        Self::new(QualityRubric::default())
    }
}

impl ConsensusStrategy for ReasoningQualityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ReasoningQuality
    }

    fn evaluate(&self, proposals: &[Proposal]) -> QuorumResult<Evaluation> {
        if proposals.is_empty() {
            return Ok(Evaluation::disagreed("no proposals to score", None));
        }

        let mut best: Option<(&Proposal, f64)> = None;
        for proposal in proposals {
            let score = self.score(proposal);
            let better = match best {
                Some((_, best_score)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((proposal, score));
            }
        }

        let Some((winner, score)) = best else {
            return Ok(Evaluation::disagreed("no proposals to score", None));
        };
        if score <= self.rubric.floor {
            return Ok(Evaluation::disagreed(
                format!(
                    "best quality score {score:.2} below floor {:.2}",
                    self.rubric.floor
                ),
                Some(score.clamp(0.0, 1.0)),
            ));
        }
        Ok(Evaluation {
            agreed: true,
            winner_proposal_id: Some(winner.id.clone()),
            agreement_rate: Some(score.clamp(0.0, 1.0)),
            reason: format!("highest reasoning quality score {score:.2}"),
        })
    }
}

/// CUSTOM default: among proposals at or above the median confidence, pick
/// the one that cost the fewest tokens.
#[derive(Default)]
pub struct TokenOptimizationStrategy;

impl ConsensusStrategy for TokenOptimizationStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Custom
    }

    fn evaluate(&self, proposals: &[Proposal]) -> QuorumResult<Evaluation> {
        if proposals.is_empty() {
            return Ok(Evaluation::disagreed("no proposals to optimize over", None));
        }

        let mut confidences: Vec<f64> = proposals.iter().map(|p| p.confidence).collect();
        confidences.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if confidences.len() % 2 == 1 {
            confidences[confidences.len() / 2]
        } else {
            let mid = confidences.len() / 2;
            (confidences[mid - 1] + confidences[mid]) / 2.0
        };

        let winner = proposals
            .iter()
            .filter(|p| p.confidence >= median)
            .min_by(|a, b| {
                a.token_usage
                    .total()
                    .cmp(&b.token_usage.total())
                    .then_with(|| {
                        b.confidence
                            .partial_cmp(&a.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.id.cmp(&b.id))
            });

        match winner {
            Some(winner) => Ok(Evaluation {
                agreed: true,
                winner_proposal_id: Some(winner.id.clone()),
                agreement_rate: None,
                reason: format!(
                    "cheapest proposal at confidence >= median ({:.2}): {} tokens",
                    median,
                    winner.token_usage.total()
                ),
            }),
            None => Ok(Evaluation::disagreed(
                "no proposal at or above the median confidence",
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use quorum_types::TokenUsage;
    use serde_json::json;

    fn proposal(id: &str, content: Value, confidence: f64, tokens: u64) -> Proposal {
        Proposal {
            id: id.to_string(),
            task_id: "t1".to_string(),
            agent_id: format!("agent-{id}"),
            input_type: "text".to_string(),
            content,
            confidence,
            token_usage: TokenUsage::new(tokens, 0),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn voting_single_proposal_always_meets_threshold() {
        let strategy = VotingStrategy::default();
        let proposals = vec![proposal("p1", json!("X"), 0.4, 10)];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert!(eval.agreed);
        assert_eq!(eval.winner_proposal_id.as_deref(), Some("p1"));
    }

    #[test]
    fn voting_picks_highest_confidence_in_majority_group() {
        let strategy = VotingStrategy::default();
        let proposals = vec![
            proposal("p1", json!("X"), 0.6, 10),
            proposal("p2", json!("X"), 0.9, 10),
            proposal("p3", json!("X"), 0.7, 10),
        ];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert!(eval.agreed);
        assert_eq!(eval.winner_proposal_id.as_deref(), Some("p2"));
        assert_eq!(eval.agreement_rate, Some(1.0));
    }

    #[test]
    fn voting_share_below_threshold_disagrees() {
        let strategy = VotingStrategy::default();
        let proposals = vec![
            proposal("p1", json!("X"), 0.6, 10),
            proposal("p2", json!("Y"), 0.9, 10),
        ];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert!(!eval.agreed);
        assert!(eval.reason.contains("below threshold"));
    }

    #[test]
    fn voting_exact_threshold_without_tie_agrees() {
        let strategy = VotingStrategy::new(0.75);
        let proposals = vec![
            proposal("p1", json!("X"), 0.5, 10),
            proposal("p2", json!("X"), 0.6, 10),
            proposal("p3", json!("X"), 0.7, 10),
            proposal("p4", json!("Y"), 0.9, 10),
        ];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert!(eval.agreed);
        assert_eq!(eval.agreement_rate, Some(0.75));
    }

    #[test]
    fn voting_tie_at_threshold_reports_tie() {
        let strategy = VotingStrategy::new(0.5);
        let proposals = vec![
            proposal("p1", json!("X"), 0.5, 10),
            proposal("p2", json!("Y"), 0.6, 10),
        ];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert!(!eval.agreed);
        assert!(eval.reason.contains("Tie"));
    }

    #[test]
    fn voting_tiebreak_is_deterministic() {
        let now = Utc::now();
        let mut p1 = proposal("p1", json!("X"), 0.9, 10);
        let mut p2 = proposal("p2", json!("X"), 0.9, 10);
        p1.created_at = now;
        p2.created_at = now + Duration::seconds(5);
        let eval = VotingStrategy::default()
            .evaluate(&[p2.clone(), p1.clone()])
            .unwrap();
        // Equal confidence: earliest creation wins.
        assert_eq!(eval.winner_proposal_id.as_deref(), Some("p1"));
    }

    #[test]
    fn quality_prefers_structured_plan() {
        let strategy = ReasoningQualityStrategy::default();
        let structured = proposal(
            "p1",
            json!({
                "steps": ["inspect", "patch", "verify"],
                "pros": ["safe"],
                "cons": ["slow"],
                "risks": ["regression"]
            }),
            0.6,
            100,
        );
        let terse = proposal("p2", json!("short"), 0.9, 10);
        let eval = strategy.evaluate(&[structured, terse]).unwrap();
        assert!(eval.agreed);
        assert_eq!(eval.winner_proposal_id.as_deref(), Some("p1"));
    }

    #[test]
    fn quality_floor_blocks_weak_proposals() {
        let strategy = ReasoningQualityStrategy::default();
        let weak = proposal("p1", json!("hm"), 0.1, 5);
        let eval = strategy.evaluate(&[weak]).unwrap();
        assert!(!eval.agreed);
        assert!(eval.reason.contains("floor"));
    }

    #[test]
    fn token_optimization_respects_median_filter() {
        let strategy = TokenOptimizationStrategy;
        let proposals = vec![
            proposal("cheap-but-weak", json!("a"), 0.1, 5),
            proposal("confident-mid", json!("b"), 0.8, 50),
            proposal("confident-big", json!("c"), 0.9, 500),
        ];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert!(eval.agreed);
        // The cheap proposal sits below the median confidence, so the
        // mid-cost confident one wins.
        assert_eq!(eval.winner_proposal_id.as_deref(), Some("confident-mid"));
    }

    #[test]
    fn token_optimization_breaks_cost_ties_by_confidence() {
        let strategy = TokenOptimizationStrategy;
        let proposals = vec![
            proposal("p1", json!("a"), 0.7, 50),
            proposal("p2", json!("b"), 0.9, 50),
        ];
        let eval = strategy.evaluate(&proposals).unwrap();
        assert_eq!(eval.winner_proposal_id.as_deref(), Some("p2"));
    }
}
