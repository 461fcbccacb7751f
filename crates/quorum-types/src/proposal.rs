use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::is_valid_content;
use crate::error::{QuorumError, QuorumResult};

/// Tokens consumed producing a proposal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(self) -> u64 {
        self.input + self.output
    }
}

/// A single agent's output for a task. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub input_type: String,
    pub content: Value,
    pub confidence: f64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Proposal {
    pub fn validate(&self) -> QuorumResult<()> {
        if self.id.trim().is_empty() || self.task_id.trim().is_empty() {
            return Err(QuorumError::Validation(
                "proposal id and task id must not be blank".into(),
            ));
        }
        if self.agent_id.trim().is_empty() {
            return Err(QuorumError::Validation(format!(
                "proposal {} has a blank agent id",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(QuorumError::Validation(format!(
                "proposal {} confidence {} outside [0, 1]",
                self.id, self.confidence
            )));
        }
        if !is_valid_content(&self.content) {
            return Err(QuorumError::Validation(format!(
                "proposal {} content fails structural validation",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn proposal(confidence: f64) -> Proposal {
        Proposal {
            id: "p1".to_string(),
            task_id: "t1".to_string(),
            agent_id: "a1".to_string(),
            input_type: "text".to_string(),
            content: json!({"answer": "X"}),
            confidence,
            token_usage: TokenUsage::new(100, 40),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn usage_totals() {
        assert_eq!(TokenUsage::new(100, 40).total(), 140);
    }

    #[test]
    fn confidence_bounds_enforced() {
        assert!(proposal(0.0).validate().is_ok());
        assert!(proposal(1.0).validate().is_ok());
        assert!(proposal(1.5).validate().is_err());
        assert!(proposal(-0.1).validate().is_err());
    }
}
