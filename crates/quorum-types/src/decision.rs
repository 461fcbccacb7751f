use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QuorumError, QuorumResult};

/// Lightweight reference to a proposal considered by a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRef {
    pub proposal_id: String,
    pub agent_id: String,
    pub tokens: u64,
}

/// The outcome of applying consensus over the proposals for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub task_id: String,
    /// Every proposal the consensus run looked at, in insertion order.
    pub considered: Vec<ProposalRef>,
    /// Subset of considered proposal ids that were selected.
    #[serde(default)]
    pub selected: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_proposal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub consensus_achieved: bool,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Decision {
    fn considered_tokens(&self) -> u64 {
        self.considered.iter().map(|p| p.tokens).sum()
    }

    fn selected_tokens(&self) -> u64 {
        self.considered
            .iter()
            .filter(|p| self.selected.contains(&p.proposal_id))
            .map(|p| p.tokens)
            .sum()
    }

    /// Tokens saved by discarding unselected proposals, floored at zero.
    pub fn token_savings_absolute(&self) -> u64 {
        self.considered_tokens()
            .saturating_sub(self.selected_tokens())
    }

    /// Savings as a fraction of all considered tokens, 0 when nothing was
    /// considered.
    pub fn token_savings_percent(&self) -> f64 {
        let considered = self.considered_tokens();
        if considered == 0 {
            return 0.0;
        }
        self.token_savings_absolute() as f64 / considered as f64
    }

    pub fn validate(&self) -> QuorumResult<()> {
        let mut seen = std::collections::HashSet::new();
        for r in &self.considered {
            if !seen.insert(r.proposal_id.as_str()) {
                return Err(QuorumError::Validation(format!(
                    "decision {} considers proposal {} twice",
                    self.id, r.proposal_id
                )));
            }
        }
        for id in &self.selected {
            if !seen.contains(id.as_str()) {
                return Err(QuorumError::Validation(format!(
                    "decision {} selects unconsidered proposal {}",
                    self.id, id
                )));
            }
        }
        if let Some(winner) = &self.winner_proposal_id {
            let pool: Vec<&String> = if self.selected.is_empty() {
                self.considered.iter().map(|r| &r.proposal_id).collect()
            } else {
                self.selected.iter().collect()
            };
            if !pool.iter().any(|id| *id == winner) {
                return Err(QuorumError::Validation(format!(
                    "decision {} winner {} outside the selection pool",
                    self.id, winner
                )));
            }
        }
        if let Some(rate) = self.agreement_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(QuorumError::Validation(format!(
                    "decision {} agreement rate {} outside [0, 1]",
                    self.id, rate
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(tokens: &[(&str, u64)]) -> Vec<ProposalRef> {
        tokens
            .iter()
            .map(|(id, t)| ProposalRef {
                proposal_id: id.to_string(),
                agent_id: format!("agent-{id}"),
                tokens: *t,
            })
            .collect()
    }

    fn decision(considered: Vec<ProposalRef>, selected: Vec<&str>) -> Decision {
        Decision {
            id: "d1".to_string(),
            task_id: "t1".to_string(),
            considered,
            selected: selected.into_iter().map(String::from).collect(),
            winner_proposal_id: None,
            agreement_rate: None,
            rationale: None,
            consensus_achieved: true,
            decided_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn savings_is_considered_minus_selected() {
        let d = decision(refs(&[("p1", 100), ("p2", 300), ("p3", 200)]), vec!["p2"]);
        assert_eq!(d.token_savings_absolute(), 300);
        assert!((d.token_savings_percent() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_considered_has_zero_savings() {
        let d = decision(Vec::new(), Vec::new());
        assert_eq!(d.token_savings_absolute(), 0);
        assert_eq!(d.token_savings_percent(), 0.0);
    }

    #[test]
    fn selected_must_be_considered() {
        let d = decision(refs(&[("p1", 10)]), vec!["p9"]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn winner_must_come_from_selection_pool() {
        let mut d = decision(refs(&[("p1", 10), ("p2", 20)]), vec!["p1"]);
        d.winner_proposal_id = Some("p2".to_string());
        assert!(d.validate().is_err());
        d.winner_proposal_id = Some("p1".to_string());
        assert!(d.validate().is_ok());
    }
}
