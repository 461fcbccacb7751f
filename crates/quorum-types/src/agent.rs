use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Busy => "busy",
        }
    }
}

/// Per-capability proficiency, scored 0..=100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStrength {
    pub capability: String,
    pub score: u8,
}

/// Static description of one agent in the fleet. Mutable status lives in the
/// registry; everything else is read-only after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub agent_type: String,
    pub display_name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub strengths: Vec<AgentStrength>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl AgentDefinition {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            display_name: display_name.into(),
            status: AgentStatus::Online,
            capabilities: BTreeSet::new(),
            strengths: Vec::new(),
            config: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Strength score for a capability, falling back to 0 when unknown.
    pub fn strength_for(&self, capability: &str) -> u8 {
        self.strengths
            .iter()
            .find(|s| s.capability == capability)
            .map(|s| s.score)
            .unwrap_or(0)
    }
}
