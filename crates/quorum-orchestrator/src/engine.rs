// Orchestration Engine
// Composes routing, the state machine, executors, consensus and the event
// bus behind the public execute/resume/route surface. One execution per
// task at a time, enforced by a fail-fast per-task mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use quorum_consensus::{ConsensusModule, ConsensusOutcome, ProposalManager, StrategyKind};
use quorum_core::{AgentRegistry, EventBus, EventStream, StateMachine, TransitionRecord};
use quorum_store::{MetricsRepo, SnapshotRepo, TaskRepo};
use quorum_types::{
    ErrorKind, EventKind, OrchestrationEvent, QuorumError, QuorumResult, RoutingStrategy, Task,
    TaskStatus, UserDirective,
};

use crate::routing::{Router, RoutingDecision};
use crate::workflow::{WorkflowExecutor, WorkflowRuntime, WorkflowStep};

/// What a single execute/resume call produced.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub decision_id: Option<String>,
}

impl WorkflowResult {
    fn failed(task_id: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            output: None,
            error_kind: Some(kind),
            message: Some(message.into()),
            decision_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on how long `run_consensus` waits for a first proposal.
    pub consensus_wait: Duration,
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consensus_wait: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub struct OrchestrationEngine {
    tasks: TaskRepo,
    snapshots: SnapshotRepo,
    metrics: MetricsRepo,
    bus: EventBus,
    state: StateMachine,
    registry: AgentRegistry,
    router: Router,
    consensus: ConsensusModule,
    executors: StdMutex<Vec<Arc<dyn WorkflowExecutor>>>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancel: CancellationToken,
    config: EngineConfig,
}

impl OrchestrationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: TaskRepo,
        snapshots: SnapshotRepo,
        metrics: MetricsRepo,
        bus: EventBus,
        registry: AgentRegistry,
        router: Router,
        consensus: ConsensusModule,
        config: EngineConfig,
    ) -> Self {
        Self {
            tasks,
            snapshots,
            metrics,
            bus,
            state: StateMachine::new(),
            registry,
            router,
            consensus,
            executors: StdMutex::new(Vec::new()),
            locks: StdMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn proposals(&self) -> &ProposalManager {
        self.consensus.manager()
    }

    /// Shared lifecycle event stream.
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn events_of(&self, kind: EventKind) -> EventStream {
        self.bus.subscribe_kind(kind)
    }

    /// Register an executor for the strategies it supports.
    pub fn register_workflow(&self, executor: Arc<dyn WorkflowExecutor>) {
        self.executors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(executor);
    }

    fn executor_for(&self, strategy: RoutingStrategy) -> Option<Arc<dyn WorkflowExecutor>> {
        self.executors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|executor| executor.supported_strategies().contains(&strategy))
            .cloned()
    }

    fn task_lock(&self, task_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Route a task without executing it.
    pub fn route(&self, task: &Task) -> QuorumResult<RoutingDecision> {
        self.router.route(task, &UserDirective::default())
    }

    /// Persist a task without executing it. The command surface for
    /// presentation layers.
    pub async fn create_task(&self, task: &Task) -> QuorumResult<()> {
        task.validate()?;
        self.tasks.upsert(task).await?;
        self.bus.publish(OrchestrationEvent::TaskCreated {
            task_id: task.id.clone(),
            title: task.title.clone(),
        });
        Ok(())
    }

    pub async fn get_task_status(&self, task_id: &str) -> QuorumResult<TaskStatus> {
        self.tasks
            .find_by_id(task_id)
            .await?
            .map(|task| task.status)
            .ok_or_else(|| QuorumError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(&self) -> QuorumResult<Vec<Task>> {
        Ok(self.tasks.list().await?)
    }

    pub async fn execute_task(
        &self,
        task: &Task,
        directive: Option<UserDirective>,
    ) -> WorkflowResult {
        self.run_guarded(task, directive, None, false).await
    }

    /// Resume a waiting task, optionally from a specific checkpoint.
    pub async fn resume_task(&self, task: &Task, checkpoint_id: Option<&str>) -> WorkflowResult {
        self.run_guarded(task, None, checkpoint_id, true).await
    }

    async fn run_guarded(
        &self,
        task: &Task,
        directive: Option<UserDirective>,
        checkpoint_id: Option<&str>,
        resume: bool,
    ) -> WorkflowResult {
        if let Err(err) = task.validate() {
            return WorkflowResult::failed(&task.id, err.kind(), err.to_string());
        }

        // Fail fast while another execution holds this task.
        let lock = self.task_lock(&task.id);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(
                target: "quorum.engine",
                task_id = %task.id,
                "concurrent execution rejected"
            );
            return WorkflowResult::failed(
                &task.id,
                ErrorKind::ConcurrentExecution,
                format!("task {} is already executing", task.id),
            );
        };

        let started = std::time::Instant::now();
        let result = self.run_locked(task, directive, checkpoint_id, resume).await;
        if let Err(err) = self
            .metrics
            .record_point(
                "workflow_duration_ms",
                started.elapsed().as_millis() as f64,
                Some(&task.id),
            )
            .await
        {
            tracing::debug!(target: "quorum.engine", "metrics write failed: {err}");
        }
        result
    }

    async fn run_locked(
        &self,
        task: &Task,
        directive: Option<UserDirective>,
        checkpoint_id: Option<&str>,
        resume: bool,
    ) -> WorkflowResult {
        // Insert or refresh the task row before anything can fail.
        if let Err(err) = self.tasks.upsert(task).await {
            let err = QuorumError::from(err);
            return WorkflowResult::failed(&task.id, err.kind(), err.to_string());
        }
        self.bus.publish(OrchestrationEvent::TaskCreated {
            task_id: task.id.clone(),
            title: task.title.clone(),
        });

        // A terminal task returns its current outcome without transitions.
        if task.status.is_terminal() {
            return WorkflowResult {
                task_id: task.id.clone(),
                status: task.status,
                output: None,
                error_kind: None,
                message: Some("task already terminal".to_string()),
                decision_id: None,
            };
        }

        let directive = directive.unwrap_or_default();
        let routing = match self.router.route(task, &directive) {
            Ok(routing) => routing,
            Err(err) => {
                return self.fail_task(task, err.kind(), err.to_string(), None).await;
            }
        };
        if let Err(err) = self.tasks.set_routing(&task.id, routing.strategy).await {
            let err = QuorumError::from(err);
            return WorkflowResult::failed(&task.id, err.kind(), err.to_string());
        }

        let from = if resume {
            TaskStatus::WaitingInput
        } else {
            TaskStatus::Pending
        };
        if !self
            .state
            .transition(&task.id, from, TaskStatus::InProgress, None)
        {
            return WorkflowResult::failed(
                &task.id,
                ErrorKind::InvalidTransition,
                format!("cannot move task {} from {from:?} to in_progress", task.id),
            );
        }
        if let Err(err) = self.tasks.set_status(&task.id, TaskStatus::InProgress).await {
            let err = QuorumError::from(err);
            return WorkflowResult::failed(&task.id, err.kind(), err.to_string());
        }

        self.bus.publish(OrchestrationEvent::WorkflowStarted {
            task_id: task.id.clone(),
            strategy: routing.strategy,
        });

        let Some(executor) = self.executor_for(routing.strategy) else {
            return self
                .fail_task(
                    task,
                    ErrorKind::NoWorkflowForStrategy,
                    format!("no workflow registered for {:?}", routing.strategy),
                    Some(routing.strategy),
                )
                .await;
        };

        let runtime = WorkflowRuntime {
            task: task.clone(),
            strategy: routing.strategy,
            primary_agent_id: routing.primary_agent_id.clone(),
            participant_agent_ids: routing.participant_agent_ids.clone(),
            proposals: self.consensus.manager().clone(),
            cancel: self.cancel.child_token(),
        };

        let step = if resume {
            executor.resume(&runtime, checkpoint_id).await
        } else {
            executor.execute(&runtime).await
        };

        match step {
            WorkflowStep::Success { output } => {
                // Workflows may ask for consensus themselves by setting
                // `consensus_requested` on their output.
                let wants_consensus = routing.strategy == RoutingStrategy::Consensus
                    || output
                        .get("consensus_requested")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                let decision_id = if wants_consensus {
                    match self.run_consensus(&task.id).await {
                        Ok(outcome) => Some(outcome.decision_id),
                        Err(err) => {
                            return self
                                .fail_task(task, err.kind(), err.to_string(), Some(routing.strategy))
                                .await;
                        }
                    }
                } else {
                    None
                };

                self.state
                    .transition(&task.id, TaskStatus::InProgress, TaskStatus::Completed, None);
                if let Err(err) = self.tasks.set_status(&task.id, TaskStatus::Completed).await {
                    tracing::warn!(target: "quorum.engine", "status persist failed: {err}");
                }
                self.bus.publish(OrchestrationEvent::WorkflowCompleted {
                    task_id: task.id.clone(),
                    strategy: routing.strategy,
                    success: true,
                    error_kind: None,
                });
                self.bus.publish(OrchestrationEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    status: TaskStatus::Completed,
                });
                WorkflowResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::Completed,
                    output: Some(output),
                    error_kind: None,
                    message: None,
                    decision_id,
                }
            }
            WorkflowStep::Waiting { reason } => {
                self.state.transition(
                    &task.id,
                    TaskStatus::InProgress,
                    TaskStatus::WaitingInput,
                    Some(json!({"reason": reason})),
                );
                if let Err(err) = self
                    .tasks
                    .set_status(&task.id, TaskStatus::WaitingInput)
                    .await
                {
                    tracing::warn!(target: "quorum.engine", "status persist failed: {err}");
                }
                WorkflowResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::WaitingInput,
                    output: None,
                    error_kind: None,
                    message: Some(reason),
                    decision_id: None,
                }
            }
            WorkflowStep::Failure { error_kind, message } => {
                self.fail_task(task, error_kind, message, Some(routing.strategy))
                    .await
            }
        }
    }

    async fn fail_task(
        &self,
        task: &Task,
        kind: ErrorKind,
        message: String,
        strategy: Option<RoutingStrategy>,
    ) -> WorkflowResult {
        // Whichever non-terminal state the task is in, move it to FAILED.
        let current = self.state.current(&task.id).unwrap_or(task.status);
        self.state.transition(
            &task.id,
            current,
            TaskStatus::Failed,
            Some(json!({"error_kind": kind.as_str(), "message": message})),
        );
        if let Err(err) = self.tasks.set_status(&task.id, TaskStatus::Failed).await {
            tracing::warn!(target: "quorum.engine", "status persist failed: {err}");
        }
        self.bus.publish(OrchestrationEvent::WorkflowCompleted {
            task_id: task.id.clone(),
            strategy: strategy.unwrap_or(task.routing),
            success: false,
            error_kind: Some(kind),
        });
        tracing::warn!(
            target: "quorum.engine",
            task_id = %task.id,
            kind = kind.as_str(),
            "task failed: {message}"
        );
        WorkflowResult::failed(&task.id, kind, message)
    }

    /// Run the consensus chain for a task with the configured wait bound.
    pub async fn run_consensus(&self, task_id: &str) -> QuorumResult<ConsensusOutcome> {
        self.consensus
            .decide(task_id, None, Some(self.config.consensus_wait))
            .await
    }

    pub async fn run_consensus_with(
        &self,
        task_id: &str,
        order: Vec<StrategyKind>,
        wait: Option<Duration>,
    ) -> QuorumResult<ConsensusOutcome> {
        self.consensus.decide(task_id, Some(order), wait).await
    }

    pub fn get_workflow_state(&self, task_id: &str, strategy: RoutingStrategy) -> Option<Value> {
        self.executor_for(strategy)
            .and_then(|executor| executor.current_state(task_id))
    }

    pub fn get_state_history(&self, task_id: &str) -> Vec<TransitionRecord> {
        self.state.history(task_id)
    }

    pub async fn get_task_context(&self, task_id: &str) -> QuorumResult<Option<Value>> {
        Ok(self.snapshots.get_for_task(task_id).await?)
    }

    pub async fn update_task_context(
        &self,
        task_id: &str,
        context: &Value,
        decision_id: Option<&str>,
    ) -> QuorumResult<()> {
        Ok(self
            .snapshots
            .upsert_for_task(task_id, context, decision_id)
            .await?)
    }

    /// Cancel in-flight executions, wait for per-task locks to drain within
    /// the grace period, then close the event bus.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let deadline = std::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let all_free = {
                let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
                locks.values().all(|lock| lock.try_lock().is_ok())
            };
            if all_free {
                break;
            }
            if std::time::Instant::now() >= deadline {
                tracing::warn!(
                    target: "quorum.engine",
                    "shutdown grace period elapsed with executions still running"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.bus.close();
        tracing::info!(target: "quorum.engine", "engine shut down");
    }
}
