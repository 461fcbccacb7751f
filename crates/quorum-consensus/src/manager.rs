use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use quorum_core::EventBus;
use quorum_store::{MetricsRepo, ProposalRepo};
use quorum_types::{new_id, OrchestrationEvent, Proposal, QuorumResult, TokenUsage};

/// Persists proposals and signals per-task waiters.
#[derive(Clone)]
pub struct ProposalManager {
    proposals: ProposalRepo,
    metrics: MetricsRepo,
    bus: EventBus,
    notifiers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl ProposalManager {
    pub fn new(proposals: ProposalRepo, metrics: MetricsRepo, bus: EventBus) -> Self {
        Self {
            proposals,
            metrics,
            bus,
            notifiers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn notifier(&self, task_id: &str) -> Arc<Notify> {
        let mut notifiers = self.notifiers.lock().unwrap_or_else(|p| p.into_inner());
        notifiers
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Persist a proposal, record its token spend, and wake any waiters for
    /// the task.
    pub async fn submit(
        &self,
        task_id: &str,
        agent_id: &str,
        content: Value,
        confidence: f64,
        token_usage: Option<TokenUsage>,
    ) -> QuorumResult<Proposal> {
        let proposal = Proposal {
            id: new_id(),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            input_type: "json".to_string(),
            content,
            confidence,
            token_usage: token_usage.unwrap_or_default(),
            created_at: Utc::now(),
            metadata: None,
        };
        proposal.validate()?;
        self.proposals.insert(&proposal).await?;
        self.metrics
            .record_usage(task_id, agent_id, proposal.token_usage)
            .await?;

        self.notifier(task_id).notify_waiters();
        self.bus.publish(OrchestrationEvent::ProposalSubmitted {
            task_id: task_id.to_string(),
            proposal_id: proposal.id.clone(),
            agent_id: agent_id.to_string(),
        });
        tracing::debug!(
            target: "quorum.consensus",
            task_id,
            agent_id,
            proposal_id = %proposal.id,
            "proposal submitted"
        );
        Ok(proposal)
    }

    /// Suspend until at least one proposal exists for the task, or the
    /// timeout elapses. Returns whether a proposal was observed.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> QuorumResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.notifier(task_id);
            let notified = notify.notified();
            if self.proposals.count_for_task(task_id).await? > 0 {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    pub async fn proposals_for_task(&self, task_id: &str) -> QuorumResult<Vec<Proposal>> {
        Ok(self.proposals.list_for_task(task_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_store::Store;
    use serde_json::json;
    use tempfile::TempDir;

    async fn manager() -> (ProposalManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let manager = ProposalManager::new(
            ProposalRepo::new(store.clone()),
            MetricsRepo::new(store),
            EventBus::new(),
        );
        (manager, dir)
    }

    #[tokio::test]
    async fn submit_persists_in_order() {
        let (manager, _dir) = manager().await;
        manager
            .submit("t1", "a1", json!("first"), 0.5, None)
            .await
            .unwrap();
        manager
            .submit("t1", "a2", json!("second"), 0.9, None)
            .await
            .unwrap();

        let proposals = manager.proposals_for_task("t1").await.unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].agent_id, "a1");
        assert_eq!(proposals[1].agent_id, "a2");
    }

    #[tokio::test]
    async fn wait_for_times_out_without_proposals() {
        let (manager, _dir) = manager().await;
        let found = manager
            .wait_for("t1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn wait_for_wakes_on_submit() {
        let (manager, _dir) = manager().await;
        let waiter = manager.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for("t1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager
            .submit("t1", "a1", json!("X"), 0.9, None)
            .await
            .unwrap();
        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_when_proposals_exist() {
        let (manager, _dir) = manager().await;
        manager
            .submit("t1", "a1", json!("X"), 0.9, None)
            .await
            .unwrap();
        let found = manager.wait_for("t1", Duration::ZERO).await.unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn invalid_confidence_is_rejected() {
        let (manager, _dir) = manager().await;
        let err = manager
            .submit("t1", "a1", json!("X"), 1.5, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), quorum_types::ErrorKind::Validation);
    }
}
