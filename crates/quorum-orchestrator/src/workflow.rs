// Workflow Executors
// One executor per routing strategy. Executors drive agents through the
// opaque invoker capability, submit proposals, checkpoint intermediate
// state, and observe cooperative cancellation at every suspension point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use quorum_consensus::ProposalManager;
use quorum_core::AgentRegistry;
use quorum_store::MessageRepo;
use quorum_types::{
    new_id, AgentDefinition, QuorumError, QuorumResult, RoutingStrategy, Task, TokenUsage,
};

const INVOKE_RETRIES: u32 = 3;
const INVOKE_BACKOFF: Duration = Duration::from_millis(100);

/// One agent's reply to an invocation.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: Value,
    pub confidence: f64,
    pub token_usage: TokenUsage,
}

/// Opaque capability the engine uses to call an agent. Transport lives
/// behind this seam.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, agent: &AgentDefinition, task: &Task) -> QuorumResult<AgentReply>;
}

/// Everything an executor needs for one run.
pub struct WorkflowRuntime {
    pub task: Task,
    pub strategy: RoutingStrategy,
    pub primary_agent_id: Option<String>,
    pub participant_agent_ids: Vec<String>,
    pub proposals: ProposalManager,
    pub cancel: CancellationToken,
}

/// Outcome of one executor run.
#[derive(Debug, Clone)]
pub enum WorkflowStep {
    Success { output: Value },
    Waiting { reason: String },
    Failure { error_kind: quorum_types::ErrorKind, message: String },
}

impl WorkflowStep {
    pub fn failure(error: &QuorumError) -> Self {
        WorkflowStep::Failure {
            error_kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub task_id: String,
    pub label: String,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    fn supported_strategies(&self) -> Vec<RoutingStrategy>;
    async fn execute(&self, runtime: &WorkflowRuntime) -> WorkflowStep;
    fn current_state(&self, task_id: &str) -> Option<Value>;
    fn checkpoints(&self, task_id: &str) -> Vec<WorkflowCheckpoint>;
    async fn resume(&self, runtime: &WorkflowRuntime, checkpoint_id: Option<&str>)
        -> WorkflowStep;
}

/// Shared plumbing: agent lookup, bounded-retry invocation, transcript
/// recording and proposal submission.
pub struct ExecutorContext {
    registry: AgentRegistry,
    invoker: std::sync::Arc<dyn AgentInvoker>,
    messages: MessageRepo,
}

impl ExecutorContext {
    pub fn new(
        registry: AgentRegistry,
        invoker: std::sync::Arc<dyn AgentInvoker>,
        messages: MessageRepo,
    ) -> Self {
        Self {
            registry,
            invoker,
            messages,
        }
    }

    /// Invoke one agent and submit its reply as a proposal. Unavailable
    /// agents are retried with bounded backoff; cancellation is observed
    /// between attempts.
    pub async fn run_agent(
        &self,
        runtime: &WorkflowRuntime,
        agent_id: &str,
    ) -> QuorumResult<AgentReply> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| QuorumError::NotFound(format!("agent {agent_id}")))?;

        self.messages
            .append(
                &runtime.task.id,
                Some(agent_id),
                "prompt",
                &runtime.task.title,
            )
            .await?;

        let mut attempt = 0u32;
        let reply = loop {
            if runtime.cancel.is_cancelled() {
                return Err(QuorumError::Cancelled);
            }
            let invocation = self.invoker.invoke(&agent, &runtime.task);
            let result = tokio::select! {
                result = invocation => result,
                _ = runtime.cancel.cancelled() => return Err(QuorumError::Cancelled),
            };
            match result {
                Ok(reply) => break reply,
                Err(err @ QuorumError::AgentUnavailable(_)) if attempt < INVOKE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(
                        target: "quorum.workflow",
                        agent_id,
                        attempt,
                        "agent unavailable, backing off: {err}"
                    );
                    tokio::time::sleep(INVOKE_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err),
            }
        };

        self.messages
            .append(
                &runtime.task.id,
                Some(agent_id),
                "reply",
                &reply.content.to_string(),
            )
            .await?;
        runtime
            .proposals
            .submit(
                &runtime.task.id,
                agent_id,
                reply.content.clone(),
                reply.confidence,
                Some(reply.token_usage),
            )
            .await?;
        Ok(reply)
    }
}

type CheckpointMap = Mutex<HashMap<String, Vec<WorkflowCheckpoint>>>;

fn record_checkpoint(map: &CheckpointMap, task_id: &str, label: &str, state: Value) {
    let mut checkpoints = map.lock().unwrap_or_else(|p| p.into_inner());
    checkpoints
        .entry(task_id.to_string())
        .or_default()
        .push(WorkflowCheckpoint {
            id: new_id(),
            task_id: task_id.to_string(),
            label: label.to_string(),
            state,
            created_at: Utc::now(),
        });
}

fn checkpoints_of(map: &CheckpointMap, task_id: &str) -> Vec<WorkflowCheckpoint> {
    map.lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(task_id)
        .cloned()
        .unwrap_or_default()
}

/// Routes the task to its single primary agent.
pub struct SoloExecutor {
    ctx: ExecutorContext,
    checkpoints: CheckpointMap,
}

impl SoloExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self {
            ctx,
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkflowExecutor for SoloExecutor {
    fn supported_strategies(&self) -> Vec<RoutingStrategy> {
        vec![RoutingStrategy::Solo]
    }

    async fn execute(&self, runtime: &WorkflowRuntime) -> WorkflowStep {
        let Some(agent_id) = runtime
            .primary_agent_id
            .clone()
            .or_else(|| runtime.participant_agent_ids.first().cloned())
        else {
            return WorkflowStep::failure(&QuorumError::AgentUnavailable(
                "no participant for solo workflow".to_string(),
            ));
        };
        match self.ctx.run_agent(runtime, &agent_id).await {
            Ok(reply) => {
                record_checkpoint(
                    &self.checkpoints,
                    &runtime.task.id,
                    "solo_complete",
                    json!({"agent": agent_id}),
                );
                WorkflowStep::Success {
                    output: reply.content,
                }
            }
            Err(err) => WorkflowStep::failure(&err),
        }
    }

    fn current_state(&self, task_id: &str) -> Option<Value> {
        checkpoints_of(&self.checkpoints, task_id)
            .last()
            .map(|c| c.state.clone())
    }

    fn checkpoints(&self, task_id: &str) -> Vec<WorkflowCheckpoint> {
        checkpoints_of(&self.checkpoints, task_id)
    }

    async fn resume(
        &self,
        runtime: &WorkflowRuntime,
        _checkpoint_id: Option<&str>,
    ) -> WorkflowStep {
        // Solo runs are atomic; resuming re-executes.
        self.execute(runtime).await
    }
}

/// Fans the task out to every participant so consensus has proposals to
/// reconcile.
pub struct ConsensusExecutor {
    ctx: ExecutorContext,
    checkpoints: CheckpointMap,
}

impl ConsensusExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self {
            ctx,
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    async fn fan_out(&self, runtime: &WorkflowRuntime) -> (u32, Vec<String>) {
        let mut submitted = 0u32;
        let mut errors = Vec::new();
        // Participants run sequentially against the shared proposal log so
        // insertion order stays deterministic.
        for agent_id in &runtime.participant_agent_ids {
            match self.ctx.run_agent(runtime, agent_id).await {
                Ok(_) => submitted += 1,
                Err(QuorumError::Cancelled) => {
                    errors.push("cancelled".to_string());
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "quorum.workflow",
                        agent_id,
                        task_id = %runtime.task.id,
                        "participant failed: {err}"
                    );
                    errors.push(format!("{agent_id}: {err}"));
                }
            }
        }
        (submitted, errors)
    }
}

#[async_trait]
impl WorkflowExecutor for ConsensusExecutor {
    fn supported_strategies(&self) -> Vec<RoutingStrategy> {
        vec![RoutingStrategy::Consensus]
    }

    async fn execute(&self, runtime: &WorkflowRuntime) -> WorkflowStep {
        let (submitted, errors) = self.fan_out(runtime).await;
        record_checkpoint(
            &self.checkpoints,
            &runtime.task.id,
            "fan_out_complete",
            json!({"submitted": submitted, "errors": errors}),
        );
        if submitted == 0 {
            return WorkflowStep::failure(&QuorumError::AgentUnavailable(format!(
                "no participant produced a proposal: {}",
                errors.join("; ")
            )));
        }
        WorkflowStep::Success {
            output: json!({"proposals_submitted": submitted}),
        }
    }

    fn current_state(&self, task_id: &str) -> Option<Value> {
        checkpoints_of(&self.checkpoints, task_id)
            .last()
            .map(|c| c.state.clone())
    }

    fn checkpoints(&self, task_id: &str) -> Vec<WorkflowCheckpoint> {
        checkpoints_of(&self.checkpoints, task_id)
    }

    async fn resume(
        &self,
        runtime: &WorkflowRuntime,
        _checkpoint_id: Option<&str>,
    ) -> WorkflowStep {
        self.execute(runtime).await
    }
}

/// Drives participants one after another, checkpointing after each so a
/// later `resume` can skip completed steps.
pub struct SequentialExecutor {
    ctx: ExecutorContext,
    checkpoints: CheckpointMap,
}

impl SequentialExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self {
            ctx,
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    async fn run_from(&self, runtime: &WorkflowRuntime, start_index: usize) -> WorkflowStep {
        let mut outputs = Vec::new();
        for (index, agent_id) in runtime
            .participant_agent_ids
            .iter()
            .enumerate()
            .skip(start_index)
        {
            match self.ctx.run_agent(runtime, agent_id).await {
                Ok(reply) => {
                    outputs.push(reply.content);
                    record_checkpoint(
                        &self.checkpoints,
                        &runtime.task.id,
                        "step_complete",
                        json!({"index": index, "agent": agent_id}),
                    );
                }
                Err(err) => return WorkflowStep::failure(&err),
            }
        }
        WorkflowStep::Success {
            output: Value::Array(outputs),
        }
    }

    fn completed_steps(&self, task_id: &str) -> usize {
        checkpoints_of(&self.checkpoints, task_id)
            .iter()
            .filter(|c| c.label == "step_complete")
            .count()
    }
}

#[async_trait]
impl WorkflowExecutor for SequentialExecutor {
    fn supported_strategies(&self) -> Vec<RoutingStrategy> {
        vec![RoutingStrategy::Sequential]
    }

    async fn execute(&self, runtime: &WorkflowRuntime) -> WorkflowStep {
        self.run_from(runtime, 0).await
    }

    fn current_state(&self, task_id: &str) -> Option<Value> {
        Some(json!({"completed_steps": self.completed_steps(task_id)}))
    }

    fn checkpoints(&self, task_id: &str) -> Vec<WorkflowCheckpoint> {
        checkpoints_of(&self.checkpoints, task_id)
    }

    async fn resume(
        &self,
        runtime: &WorkflowRuntime,
        checkpoint_id: Option<&str>,
    ) -> WorkflowStep {
        let start = match checkpoint_id {
            Some(id) => checkpoints_of(&self.checkpoints, &runtime.task.id)
                .iter()
                .position(|c| c.id == id)
                .map(|p| p + 1)
                .unwrap_or(0),
            None => self.completed_steps(&runtime.task.id),
        };
        self.run_from(runtime, start).await
    }
}

/// Invokes all participants concurrently and gathers every output.
pub struct ParallelExecutor {
    ctx: std::sync::Arc<ExecutorContext>,
    checkpoints: CheckpointMap,
}

impl ParallelExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self {
            ctx: std::sync::Arc::new(ctx),
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkflowExecutor for ParallelExecutor {
    fn supported_strategies(&self) -> Vec<RoutingStrategy> {
        vec![RoutingStrategy::Parallel]
    }

    async fn execute(&self, runtime: &WorkflowRuntime) -> WorkflowStep {
        let futures: Vec<_> = runtime
            .participant_agent_ids
            .iter()
            .map(|agent_id| {
                let ctx = self.ctx.clone();
                async move { (agent_id.clone(), ctx.run_agent(runtime, agent_id).await) }
            })
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut outputs = Vec::new();
        let mut failures = Vec::new();
        for (agent_id, result) in results {
            match result {
                Ok(reply) => outputs.push(reply.content),
                Err(err) => failures.push(format!("{agent_id}: {err}")),
            }
        }
        record_checkpoint(
            &self.checkpoints,
            &runtime.task.id,
            "parallel_complete",
            json!({"succeeded": outputs.len(), "failed": failures.len()}),
        );
        if outputs.is_empty() {
            return WorkflowStep::failure(&QuorumError::AgentUnavailable(format!(
                "all participants failed: {}",
                failures.join("; ")
            )));
        }
        WorkflowStep::Success {
            output: Value::Array(outputs),
        }
    }

    fn current_state(&self, task_id: &str) -> Option<Value> {
        checkpoints_of(&self.checkpoints, task_id)
            .last()
            .map(|c| c.state.clone())
    }

    fn checkpoints(&self, task_id: &str) -> Vec<WorkflowCheckpoint> {
        checkpoints_of(&self.checkpoints, task_id)
    }

    async fn resume(
        &self,
        runtime: &WorkflowRuntime,
        _checkpoint_id: Option<&str>,
    ) -> WorkflowStep {
        self.execute(runtime).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::EventBus;
    use quorum_store::{MetricsRepo, ProposalRepo, Store};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct EchoInvoker;

    #[async_trait]
    impl AgentInvoker for EchoInvoker {
        async fn invoke(&self, agent: &AgentDefinition, task: &Task) -> QuorumResult<AgentReply> {
            Ok(AgentReply {
                content: json!({"agent": agent.id, "task": task.id}),
                confidence: 0.8,
                token_usage: TokenUsage::new(10, 5),
            })
        }
    }

    struct FlakyInvoker {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl AgentInvoker for FlakyInvoker {
        async fn invoke(&self, agent: &AgentDefinition, _task: &Task) -> QuorumResult<AgentReply> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err(QuorumError::AgentUnavailable(agent.id.clone()));
            }
            Ok(AgentReply {
                content: json!("recovered"),
                confidence: 0.9,
                token_usage: TokenUsage::default(),
            })
        }
    }

    async fn runtime_with(
        invoker: Arc<dyn AgentInvoker>,
        participants: &[&str],
    ) -> (ExecutorContext, WorkflowRuntime, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let registry = AgentRegistry::new(
            participants
                .iter()
                .map(|id| AgentDefinition::new(*id, "coder", *id))
                .collect(),
        );
        let proposals = ProposalManager::new(
            ProposalRepo::new(store.clone()),
            MetricsRepo::new(store.clone()),
            EventBus::new(),
        );
        let ctx = ExecutorContext::new(registry, invoker, MessageRepo::new(store));
        let runtime = WorkflowRuntime {
            task: Task::new("t1", "solve it", quorum_types::TaskType::Implementation),
            strategy: RoutingStrategy::Solo,
            primary_agent_id: participants.first().map(|s| s.to_string()),
            participant_agent_ids: participants.iter().map(|s| s.to_string()).collect(),
            proposals,
            cancel: CancellationToken::new(),
        };
        (ctx, runtime, dir)
    }

    #[tokio::test]
    async fn solo_executes_primary_and_submits_proposal() {
        let (ctx, runtime, _dir) = runtime_with(Arc::new(EchoInvoker), &["a1"]).await;
        let executor = SoloExecutor::new(ctx);

        let step = executor.execute(&runtime).await;
        assert!(matches!(step, WorkflowStep::Success { .. }));

        let proposals = runtime.proposals.proposals_for_task("t1").await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].agent_id, "a1");
    }

    #[tokio::test]
    async fn consensus_fans_out_to_all_participants() {
        let (ctx, runtime, _dir) =
            runtime_with(Arc::new(EchoInvoker), &["a1", "a2", "a3"]).await;
        let executor = ConsensusExecutor::new(ctx);

        let step = executor.execute(&runtime).await;
        assert!(matches!(step, WorkflowStep::Success { .. }));

        let proposals = runtime.proposals.proposals_for_task("t1").await.unwrap();
        assert_eq!(proposals.len(), 3);
    }

    #[tokio::test]
    async fn sequential_resume_skips_completed_steps() {
        let (ctx, runtime, _dir) = runtime_with(Arc::new(EchoInvoker), &["a1", "a2"]).await;
        let executor = SequentialExecutor::new(ctx);

        let step = executor.execute(&runtime).await;
        assert!(matches!(step, WorkflowStep::Success { .. }));
        assert_eq!(executor.checkpoints("t1").len(), 2);

        // Resuming with all steps complete invokes nobody further.
        let step = executor.resume(&runtime, None).await;
        match step {
            WorkflowStep::Success { output } => {
                assert_eq!(output, json!([]));
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_agents_are_retried() {
        let invoker = Arc::new(FlakyInvoker {
            failures_left: AtomicU32::new(2),
        });
        let (ctx, runtime, _dir) = runtime_with(invoker, &["a1"]).await;
        let executor = SoloExecutor::new(ctx);

        let step = executor.execute(&runtime).await;
        assert!(matches!(step, WorkflowStep::Success { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_execution() {
        let (ctx, runtime, _dir) = runtime_with(Arc::new(EchoInvoker), &["a1"]).await;
        runtime.cancel.cancel();
        let executor = SoloExecutor::new(ctx);

        let step = executor.execute(&runtime).await;
        match step {
            WorkflowStep::Failure { error_kind, .. } => {
                assert_eq!(error_kind, quorum_types::ErrorKind::Cancelled);
            }
            other => panic!("expected cancellation failure, got {other:?}"),
        }
    }
}
