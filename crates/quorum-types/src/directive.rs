use serde::{Deserialize, Serialize};

/// Parsed hints extracted from a user's request. Each hint carries its own
/// confidence in [0, 1]; a hint only takes effect above the caller's
/// confidence threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDirective {
    #[serde(default)]
    pub force_consensus: bool,
    #[serde(default)]
    pub force_consensus_confidence: f64,
    #[serde(default)]
    pub prevent_consensus: bool,
    #[serde(default)]
    pub prevent_consensus_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_to_agent: Option<String>,
    #[serde(default)]
    pub assign_confidence: f64,
    #[serde(default)]
    pub assigned_agents: Vec<String>,
    #[serde(default)]
    pub is_emergency: bool,
    #[serde(default)]
    pub emergency_confidence: f64,
}

impl UserDirective {
    pub fn forcing_consensus(confidence: f64) -> Self {
        Self {
            force_consensus: true,
            force_consensus_confidence: confidence,
            ..Self::default()
        }
    }

    pub fn preventing_consensus(confidence: f64) -> Self {
        Self {
            prevent_consensus: true,
            prevent_consensus_confidence: confidence,
            ..Self::default()
        }
    }

    pub fn assigning(agent_id: impl Into<String>, confidence: f64) -> Self {
        Self {
            assign_to_agent: Some(agent_id.into()),
            assign_confidence: confidence,
            ..Self::default()
        }
    }
}
