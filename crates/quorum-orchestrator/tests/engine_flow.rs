// End-to-end engine scenarios: solo completion, consensus over proposals,
// strategy fallback, and the per-task execution mutex.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

use quorum_consensus::{
    ConsensusModule, ProposalManager, ReasoningQualityStrategy, StrategyKind,
    TokenOptimizationStrategy, VotingStrategy,
};
use quorum_core::{AgentRegistry, EventBus};
use quorum_orchestrator::{
    AgentInvoker, AgentReply, ConsensusExecutor, EngineConfig, ExecutorContext,
    OrchestrationEngine, ParallelExecutor, Router, SequentialExecutor, SoloExecutor,
    WorkflowExecutor, WorkflowRuntime, WorkflowStep,
};
use quorum_store::{
    DecisionRepo, MessageRepo, MetricsRepo, ProposalRepo, SnapshotRepo, Store, TaskRepo,
};
use quorum_types::{
    AgentDefinition, ErrorKind, EventKind, OrchestrationEvent, QuorumResult, RoutingStrategy,
    Task, TaskStatus, TaskType, TokenUsage,
};

struct EchoInvoker;

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(&self, agent: &AgentDefinition, task: &Task) -> QuorumResult<AgentReply> {
        Ok(AgentReply {
            content: json!({"agent": agent.id, "answer": format!("done: {}", task.title)}),
            confidence: 0.8,
            token_usage: TokenUsage::new(20, 10),
        })
    }
}

async fn build_engine(agents: Vec<AgentDefinition>) -> (Arc<OrchestrationEngine>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open_at(&dir.path().join("engine.db")).await.unwrap();

    let bus = EventBus::new();
    let registry = AgentRegistry::new(agents).with_bus(bus.clone());
    let router = Router::new(registry.clone());

    let manager = ProposalManager::new(
        ProposalRepo::new(store.clone()),
        MetricsRepo::new(store.clone()),
        bus.clone(),
    );
    let mut consensus = ConsensusModule::new(manager, DecisionRepo::new(store.clone()));
    consensus.register(Arc::new(VotingStrategy::default()));
    consensus.register(Arc::new(ReasoningQualityStrategy::default()));
    consensus.register(Arc::new(TokenOptimizationStrategy));

    let engine = Arc::new(OrchestrationEngine::new(
        TaskRepo::new(store.clone()),
        SnapshotRepo::new(store.clone()),
        MetricsRepo::new(store.clone()),
        bus,
        registry.clone(),
        router,
        consensus,
        EngineConfig {
            consensus_wait: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(500),
        },
    ));

    let invoker: Arc<dyn AgentInvoker> = Arc::new(EchoInvoker);
    let messages = MessageRepo::new(store);
    let ctx = |registry: &AgentRegistry| {
        ExecutorContext::new(registry.clone(), invoker.clone(), messages.clone())
    };
    engine.register_workflow(Arc::new(SoloExecutor::new(ctx(&registry))));
    engine.register_workflow(Arc::new(ConsensusExecutor::new(ctx(&registry))));
    engine.register_workflow(Arc::new(SequentialExecutor::new(ctx(&registry))));
    engine.register_workflow(Arc::new(ParallelExecutor::new(ctx(&registry))));

    (engine, dir)
}

fn default_fleet() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new("a1", "coder", "Coder One").with_capabilities(["code"]),
        AgentDefinition::new("a2", "coder", "Coder Two").with_capabilities(["code"]),
        AgentDefinition::new("a3", "reviewer", "Reviewer").with_capabilities(["review"]),
    ]
}

#[tokio::test]
async fn solo_task_completes_with_history_and_events() {
    let (engine, _dir) = build_engine(vec![AgentDefinition::new("a1", "coder", "Solo Coder")
        .with_capabilities(["code"])])
    .await;

    let mut created = engine.events_of(EventKind::TaskCreated);
    let mut completed = engine.events_of(EventKind::WorkflowCompleted);

    let task = Task::new("T1", "implement the widget", TaskType::Implementation);
    let result = engine.execute_task(&task, None).await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.error_kind.is_none());

    let history = engine.get_state_history("T1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from, TaskStatus::Pending);
    assert_eq!(history[0].to, TaskStatus::InProgress);
    assert_eq!(history[1].to, TaskStatus::Completed);

    let mut created_count = 0;
    while created.try_next().is_some() {
        created_count += 1;
    }
    assert_eq!(created_count, 1);

    let mut completed_count = 0;
    while let Some(event) = completed.try_next() {
        completed_count += 1;
        assert!(matches!(
            event,
            OrchestrationEvent::WorkflowCompleted { success: true, .. }
        ));
    }
    assert_eq!(completed_count, 1);
}

#[tokio::test]
async fn consensus_task_persists_a_decision() {
    let (engine, _dir) = build_engine(default_fleet()).await;

    let mut task = Task::new("T2", "choose the migration approach", TaskType::Architecture);
    task.risk = 9;
    let result = engine
        .execute_task(&task, Some(quorum_types::UserDirective::forcing_consensus(0.95)))
        .await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.decision_id.is_some());
}

#[tokio::test]
async fn voting_consensus_picks_highest_confidence_winner() {
    let (engine, _dir) = build_engine(default_fleet()).await;

    // Seed agreement by hand: three agents, identical content.
    let manager = engine.proposals();
    manager
        .submit("T2v", "a1", json!("X"), 0.6, None)
        .await
        .unwrap();
    let expected = manager
        .submit("T2v", "a2", json!("X"), 0.9, None)
        .await
        .unwrap();
    manager
        .submit("T2v", "a3", json!("X"), 0.7, None)
        .await
        .unwrap();

    let outcome = engine
        .run_consensus_with("T2v", vec![StrategyKind::Voting], None)
        .await
        .unwrap();

    assert!(outcome.agreed);
    assert_eq!(
        outcome.winner_proposal_id.as_deref(),
        Some(expected.id.as_str())
    );
}

#[tokio::test]
async fn chain_falls_back_when_voting_finds_no_supermajority() {
    let (engine, _dir) = build_engine(default_fleet()).await;

    let manager = engine.proposals();
    let structured = manager
        .submit(
            "T3",
            "b1",
            json!({
                "steps": ["profile the endpoint", "cache the hot query", "measure again"],
                "pros": ["fast win"],
                "cons": ["cache invalidation"],
                "risks": ["stale reads"]
            }),
            0.6,
            Some(TokenUsage::new(300, 50)),
        )
        .await
        .unwrap();
    manager
        .submit("T3", "b2", json!("short"), 0.9, Some(TokenUsage::new(5, 1)))
        .await
        .unwrap();

    let outcome = engine
        .run_consensus_with(
            "T3",
            vec![StrategyKind::Voting, StrategyKind::ReasoningQuality],
            None,
        )
        .await
        .unwrap();

    assert!(outcome.agreed);
    assert_eq!(outcome.strategy, Some(StrategyKind::ReasoningQuality));
    assert_eq!(
        outcome.winner_proposal_id.as_deref(),
        Some(structured.id.as_str())
    );
    assert!(!outcome.trail[0].agreed);
}

/// Completes only once `release` fires; used to hold the per-task mutex.
struct BlockingExecutor {
    release: Arc<Notify>,
}

#[async_trait]
impl WorkflowExecutor for BlockingExecutor {
    fn supported_strategies(&self) -> Vec<RoutingStrategy> {
        vec![RoutingStrategy::Solo]
    }

    async fn execute(&self, _runtime: &WorkflowRuntime) -> WorkflowStep {
        self.release.notified().await;
        WorkflowStep::Success {
            output: json!("released"),
        }
    }

    fn current_state(&self, _task_id: &str) -> Option<serde_json::Value> {
        None
    }

    fn checkpoints(&self, _task_id: &str) -> Vec<quorum_orchestrator::WorkflowCheckpoint> {
        Vec::new()
    }

    async fn resume(
        &self,
        runtime: &WorkflowRuntime,
        _checkpoint_id: Option<&str>,
    ) -> WorkflowStep {
        self.execute(runtime).await
    }
}

#[tokio::test]
async fn concurrent_execution_fails_fast_with_mutex_error() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_at(&dir.path().join("engine.db")).await.unwrap();

    let bus = EventBus::new();
    let registry = AgentRegistry::new(vec![
        AgentDefinition::new("a1", "coder", "Coder").with_capabilities(["code"]),
    ]);
    let router = Router::new(registry.clone());
    let manager = ProposalManager::new(
        ProposalRepo::new(store.clone()),
        MetricsRepo::new(store.clone()),
        bus.clone(),
    );
    let mut consensus = ConsensusModule::new(manager, DecisionRepo::new(store.clone()));
    consensus.register(Arc::new(VotingStrategy::default()));

    let engine = Arc::new(OrchestrationEngine::new(
        TaskRepo::new(store.clone()),
        SnapshotRepo::new(store.clone()),
        MetricsRepo::new(store),
        bus,
        registry,
        router,
        consensus,
        EngineConfig::default(),
    ));

    let release = Arc::new(Notify::new());
    engine.register_workflow(Arc::new(BlockingExecutor {
        release: release.clone(),
    }));

    let task = Task::new("T4", "long running work", TaskType::Implementation);

    let first_engine = engine.clone();
    let first_task = task.clone();
    let first = tokio::spawn(async move { first_engine.execute_task(&first_task, None).await });

    // Give the first call time to take the lock and block.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let second = engine.execute_task(&task, None).await;
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(second.status, TaskStatus::Failed);
    assert_eq!(second.error_kind, Some(ErrorKind::ConcurrentExecution));

    release.notify_waiters();
    let first = first.await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
}

#[tokio::test]
async fn missing_executor_fails_the_task() {
    let (engine, _dir) = build_engine(default_fleet()).await;

    // Re-build without registering anything by using a fresh engine.
    let dir = TempDir::new().unwrap();
    let store = Store::open_at(&dir.path().join("bare.db")).await.unwrap();
    let bus = EventBus::new();
    let registry = AgentRegistry::new(default_fleet());
    let manager = ProposalManager::new(
        ProposalRepo::new(store.clone()),
        MetricsRepo::new(store.clone()),
        bus.clone(),
    );
    let consensus = ConsensusModule::new(manager, DecisionRepo::new(store.clone()));
    let bare = OrchestrationEngine::new(
        TaskRepo::new(store.clone()),
        SnapshotRepo::new(store.clone()),
        MetricsRepo::new(store),
        bus,
        registry.clone(),
        Router::new(registry),
        consensus,
        EngineConfig::default(),
    );

    let task = Task::new("T5", "anything", TaskType::Implementation);
    let result = bare.execute_task(&task, None).await;
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error_kind, Some(ErrorKind::NoWorkflowForStrategy));

    // The fully-built engine still works for the same task id.
    let ok = engine.execute_task(&task, None).await;
    assert_eq!(ok.status, TaskStatus::Completed);
}

#[tokio::test]
async fn terminal_tasks_are_not_reexecuted() {
    let (engine, _dir) = build_engine(default_fleet()).await;

    let mut task = Task::new("T6", "already done", TaskType::Implementation);
    task.status = TaskStatus::Completed;

    let result = engine.execute_task(&task, None).await;
    assert_eq!(result.status, TaskStatus::Completed);
    assert!(engine.get_state_history("T6").is_empty());
}

#[tokio::test]
async fn task_context_round_trips() {
    let (engine, _dir) = build_engine(default_fleet()).await;

    assert!(engine.get_task_context("T7").await.unwrap().is_none());
    engine
        .update_task_context("T7", &json!({"files": ["src/lib.rs"]}), None)
        .await
        .unwrap();
    assert_eq!(
        engine.get_task_context("T7").await.unwrap(),
        Some(json!({"files": ["src/lib.rs"]}))
    );
}

#[tokio::test]
async fn shutdown_closes_the_event_stream() {
    let (engine, _dir) = build_engine(default_fleet()).await;
    let mut events = engine.events();

    let task = Task::new("T8", "quick job", TaskType::Implementation);
    let result = engine.execute_task(&task, None).await;
    assert_eq!(result.status, TaskStatus::Completed);

    engine.shutdown().await;

    // Drain whatever was published, then observe end-of-stream.
    while events.try_next().is_some() {}
    assert!(events.next().await.is_none());
}
