use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use quorum_types::{AgentDefinition, AgentStatus, OrchestrationEvent};

use crate::event_bus::EventBus;

/// Pluggable health probe applied to each registered agent.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, agent: &AgentDefinition) -> AgentStatus;
}

/// Process-wide directory of agents keyed by id.
///
/// The capability index is built once at construction, so capability lookups
/// cost O(agents with that capability). Status updates take the write lock,
/// which makes them linearizable; readers always observe a consistent
/// snapshot.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentDefinition>>>,
    by_capability: Arc<HashMap<String, Vec<String>>>,
    bus: Option<EventBus>,
}

impl AgentRegistry {
    pub fn new(definitions: Vec<AgentDefinition>) -> Self {
        let mut by_capability: HashMap<String, Vec<String>> = HashMap::new();
        let mut agents = HashMap::new();
        for agent in definitions {
            for capability in &agent.capabilities {
                by_capability
                    .entry(capability.clone())
                    .or_default()
                    .push(agent.id.clone());
            }
            agents.insert(agent.id.clone(), agent);
        }
        Self {
            agents: Arc::new(RwLock::new(agents)),
            by_capability: Arc::new(by_capability),
            bus: None,
        }
    }

    /// Publish status changes to the given bus.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn get(&self, id: &str) -> Option<AgentDefinition> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<AgentDefinition> = self
            .agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Agents advertising a capability, via the pre-built index.
    pub fn by_capability(&self, capability: &str) -> Vec<AgentDefinition> {
        let Some(ids) = self.by_capability.get(capability) else {
            return Vec::new();
        };
        let agents = self.agents.read().unwrap_or_else(|p| p.into_inner());
        ids.iter().filter_map(|id| agents.get(id).cloned()).collect()
    }

    /// Atomically update one agent's status. Returns whether the agent was
    /// present.
    pub fn update_status(&self, id: &str, status: AgentStatus) -> bool {
        let changed = {
            let mut agents = self.agents.write().unwrap_or_else(|p| p.into_inner());
            match agents.get_mut(id) {
                Some(agent) => {
                    let changed = agent.status != status;
                    agent.status = status;
                    Some(changed)
                }
                None => None,
            }
        };
        match changed {
            Some(changed) => {
                if changed {
                    if let Some(bus) = &self.bus {
                        bus.publish(OrchestrationEvent::AgentStatusChanged {
                            agent_id: id.to_string(),
                            status,
                        });
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Apply `checker` to every agent and store the statuses it returns.
    pub async fn run_health_checks(&self, checker: &dyn HealthCheck) {
        let snapshot = self.all();
        for agent in snapshot {
            let status = checker.check(&agent).await;
            if !self.update_status(&agent.id, status) {
                tracing::warn!(
                    target: "quorum.registry",
                    agent_id = %agent.id,
                    "agent disappeared during health check"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> Vec<AgentDefinition> {
        vec![
            AgentDefinition::new("a1", "coder", "Coder One")
                .with_capabilities(["code", "review"]),
            AgentDefinition::new("a2", "coder", "Coder Two").with_capabilities(["code"]),
            AgentDefinition::new("a3", "researcher", "Researcher")
                .with_capabilities(["research"]),
        ]
    }

    struct AllOffline;

    #[async_trait]
    impl HealthCheck for AllOffline {
        async fn check(&self, _agent: &AgentDefinition) -> AgentStatus {
            AgentStatus::Offline
        }
    }

    #[test]
    fn capability_index_finds_agents() {
        let registry = AgentRegistry::new(fleet());
        let coders = registry.by_capability("code");
        assert_eq!(coders.len(), 2);
        assert!(registry.by_capability("deploy").is_empty());
    }

    #[test]
    fn update_status_reports_presence() {
        let registry = AgentRegistry::new(fleet());
        assert!(registry.update_status("a1", AgentStatus::Busy));
        assert!(!registry.update_status("ghost", AgentStatus::Busy));
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn health_checks_store_returned_status() {
        let registry = AgentRegistry::new(fleet());
        registry.run_health_checks(&AllOffline).await;
        for agent in registry.all() {
            assert_eq!(agent.status, AgentStatus::Offline);
        }
    }

    #[tokio::test]
    async fn status_change_publishes_event() {
        let bus = EventBus::new();
        let registry = AgentRegistry::new(fleet()).with_bus(bus.clone());
        let mut stream = bus.subscribe_kind(quorum_types::EventKind::AgentStatusChanged);

        registry.update_status("a1", AgentStatus::Busy);
        let event = stream.next().await.unwrap();
        assert!(matches!(
            event,
            OrchestrationEvent::AgentStatusChanged { agent_id, status }
                if agent_id == "a1" && status == AgentStatus::Busy
        ));
    }
}
