//! End-to-end tests for `WorkflowEngine`: registration, admission, the worker
//! loop, retries, cancellation and shutdown, all against in-memory backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use agents::mock::MockAgent;
use agents::AgentRegistry;
use breaker::BreakerConfig;
use db::{DbError, ExecutionFilter, ExecutionRow, InMemoryStorage, WorkflowRow, WorkflowStore};
use pool::PoolConfig;

use crate::auth::{Actor, RoleAuthorizer};
use crate::config::{EngineConfig, WorkerCounts};
use crate::engine::{ExecuteOptions, ExecutionQuery, WorkflowEngine};
use crate::models::{ExecutionStatus, Priority, StepStatus, Trigger, WorkflowDefinition, WorkflowExecution, WorkflowStep};
use crate::resources::{Cleanup, ResourceKind};
use crate::{EngineError, EngineEvent};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> EngineConfig {
    EngineConfig {
        workers: WorkerCounts { critical: 1, high: 1, normal: 2, background: 1 },
        dequeue_wait: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        registration_lock_ttl: Duration::from_secs(5),
        step_retries: 0,
        step_retry_base_delay: Duration::from_millis(1),
        pool: PoolConfig { min_size: 1, max_size: 4, ..PoolConfig::default() },
        breaker: BreakerConfig { cache_ttl: Duration::ZERO, ..BreakerConfig::default() },
        ..EngineConfig::default()
    }
}

fn registry(agents: &[(&str, Arc<MockAgent>)]) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for (agent_type, agent) in agents {
        registry.register(*agent_type, agent.clone());
    }
    registry
}

async fn engine_with(agents: &[(&str, Arc<MockAgent>)], config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::builder().config(config).agents(registry(agents)).build().await.unwrap()
}

async fn engine_on(store: Arc<dyn WorkflowStore>, agents: &[(&str, Arc<MockAgent>)], config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::builder().config(config).storage(store).agents(registry(agents)).build().await.unwrap()
}

/// In-memory store with hooks for interleavings that are hard to hit by timing.
#[derive(Default)]
struct ScriptedStore {
    inner: InMemoryStorage,
    /// Slows every `insert_execution`.
    insert_delay: Duration,
    /// Marks the record cancelled right before a COMPLETED write lands.
    cancel_before_complete: bool,
}

#[async_trait]
impl WorkflowStore for ScriptedStore {
    async fn upsert_definition(&self, row: &WorkflowRow) -> Result<WorkflowRow, DbError> {
        self.inner.upsert_definition(row).await
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        self.inner.get_definition(id).await
    }

    async fn get_definition_version(&self, id: Uuid, version: i32) -> Result<Option<WorkflowRow>, DbError> {
        self.inner.get_definition_version(id, version).await
    }

    async fn list_definitions(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowRow>, DbError> {
        self.inner.list_definitions(limit, offset).await
    }

    async fn count_definitions(&self) -> Result<i64, DbError> {
        self.inner.count_definitions().await
    }

    async fn insert_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        tokio::time::sleep(self.insert_delay).await;
        self.inner.insert_execution(row).await
    }

    async fn update_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        if self.cancel_before_complete && row.status == "completed" {
            let mut cancelled = row.clone();
            cancelled.status = "cancelled".into();
            self.inner.update_execution(&cancelled).await?;
        }
        self.inner.update_execution(row).await
    }

    async fn delete_execution(&self, id: Uuid) -> Result<bool, DbError> {
        self.inner.delete_execution(id).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError> {
        self.inner.get_execution(id).await
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRow>, DbError> {
        self.inner.list_executions(filter).await
    }

    async fn count_executions_by_status(&self) -> Result<HashMap<String, i64>, DbError> {
        self.inner.count_executions_by_status().await
    }

    async fn health_check(&self) -> Result<(), DbError> {
        self.inner.health_check().await
    }
}

fn chain(name: &str, agent_types: &[&str]) -> WorkflowDefinition {
    let ids = ["a", "b", "c", "d"];
    let steps = agent_types
        .iter()
        .enumerate()
        .map(|(i, agent_type)| {
            let step = WorkflowStep::new(ids[i], *agent_type);
            if i == 0 {
                step
            } else {
                step.depends_on(&[ids[i - 1]])
            }
        })
        .collect();
    WorkflowDefinition::new(name, steps)
}

async fn wait_for<F>(engine: &WorkflowEngine, id: Uuid, done: F) -> WorkflowExecution
where
    F: Fn(&WorkflowExecution) -> bool,
{
    let poll = async {
        loop {
            if let Some(exec) = engine.get_execution(id).await.unwrap() {
                if done(&exec) {
                    return exec;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll).await.expect("execution did not reach the expected state")
}

async fn wait_terminal(engine: &WorkflowEngine, id: Uuid) -> WorkflowExecution {
    wait_for(engine, id, |e| e.status.is_terminal()).await
}

async fn run(engine: &WorkflowEngine, workflow_id: Uuid, input: Value) -> Uuid {
    engine.execute_workflow(workflow_id, input, ExecuteOptions::default(), &Actor::system()).await.unwrap()
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_definition_is_rejected_and_not_stored() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let def = WorkflowDefinition::new(
        "loop",
        vec![WorkflowStep::new("a", "t").depends_on(&["b"]), WorkflowStep::new("b", "t").depends_on(&["a"])],
    );

    let err = engine.register_workflow(def, &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { .. }));
    assert!(engine.list_workflows(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_agent_type_is_rejected() {
    let engine = engine_with(&[], test_config()).await;
    let err = engine.register_workflow(chain("x", &["nope"]), &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(msg) if msg.contains("nope")));
}

#[tokio::test]
async fn step_limit_is_enforced() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], EngineConfig { max_steps: 2, ..test_config() }).await;
    let err = engine.register_workflow(chain("long", &["t", "t", "t"]), &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::TooManySteps { count: 3, max: 2 }));
}

#[tokio::test]
async fn reregistration_bumps_version_only_on_change() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let def = chain("versions", &["t"]);
    let id = def.id;

    let first = engine.register_workflow(def.clone(), &Actor::system()).await.unwrap();
    assert_eq!(first.version, 1);
    let same = engine.register_workflow(def.clone(), &Actor::system()).await.unwrap();
    assert_eq!(same.version, 1);

    let mut changed = def;
    changed.steps.push(WorkflowStep::new("b", "t").depends_on(&["a"]));
    let second = engine.register_workflow(changed, &Actor::system()).await.unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(engine.get_workflow(id).await.unwrap().unwrap().steps.len(), 2);
}

#[tokio::test]
async fn definition_cap_holds_under_concurrent_registration() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], EngineConfig { max_definitions: 2, ..test_config() }).await;

    let mut handles = Vec::new();
    for n in 0..6 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.register_workflow(chain(&format!("wf-{n}"), &["t"]), &Actor::system()).await
        }));
    }
    let mut stored = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => stored += 1,
            Err(EngineError::DefinitionLimit { max: 2 }) | Err(EngineError::Lock(_)) => {}
            Err(e) => panic!("unexpected registration error: {e}"),
        }
    }

    assert!((1..=2).contains(&stored));
    assert_eq!(engine.list_workflows(100, 0).await.unwrap().len(), stored);
}

#[tokio::test]
async fn webhook_trigger_lookup() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let mut def = chain("hooked", &["t"]);
    def.triggers = vec![Trigger::Webhook { path: "line-3/alarm".into() }];
    engine.register_workflow(def.clone(), &Actor::system()).await.unwrap();

    assert_eq!(engine.workflow_for_webhook("line-3/alarm").await.unwrap().map(|d| d.id), Some(def.id));
    assert!(engine.workflow_for_webhook("line-4/alarm").await.unwrap().is_none());
}

#[tokio::test]
async fn viewer_cannot_register_or_execute() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let mut registry = AgentRegistry::new();
    registry.register("t", agent);
    let engine = WorkflowEngine::builder()
        .config(test_config())
        .agents(registry)
        .authorizer(Arc::new(RoleAuthorizer::with_default_roles()))
        .build()
        .await
        .unwrap();
    let viewer = Actor::new("dana", &["viewer"]);
    let def = chain("guarded", &["t"]);

    let err = engine.register_workflow(def.clone(), &viewer).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));

    engine.register_workflow(def.clone(), &Actor::system()).await.unwrap();
    let err = engine.execute_workflow(def.id, json!({}), ExecuteOptions::default(), &viewer).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let engine = engine_with(&[], test_config()).await;
    let missing = Uuid::new_v4();
    let err = engine.execute_workflow(missing, json!({}), ExecuteOptions::default(), &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(id) if id == missing));
}

#[tokio::test]
async fn duplicate_execution_id_is_rejected() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let def = engine.register_workflow(chain("dup", &["t"]), &Actor::system()).await.unwrap();
    let id = Uuid::new_v4();
    let options = ExecuteOptions { execution_id: Some(id), ..ExecuteOptions::default() };

    assert_eq!(engine.execute_workflow(def.id, json!({}), options.clone(), &Actor::system()).await.unwrap(), id);
    let err = engine.execute_workflow(def.id, json!({}), options, &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateExecution(dup) if dup == id));
}

#[tokio::test]
async fn capacity_limit_rejects_admission() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], EngineConfig { max_concurrent_workflows: 1, ..test_config() }).await;
    let def = engine.register_workflow(chain("cap", &["t"]), &Actor::system()).await.unwrap();

    run(&engine, def.id, json!({})).await;
    let err = engine.execute_workflow(def.id, json!({}), ExecuteOptions::default(), &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { active: 1, max: 1 }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn capacity_limit_holds_for_concurrent_callers() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let store = Arc::new(ScriptedStore { insert_delay: Duration::from_millis(5), ..ScriptedStore::default() });
    let engine =
        engine_on(store, &[("t", agent)], EngineConfig { max_concurrent_workflows: 1, ..test_config() }).await;
    let def = engine.register_workflow(chain("race", &["t"]), &Actor::system()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.execute_workflow(def.id, json!({}), ExecuteOptions::default(), &Actor::system()).await
        }));
    }
    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(matches!(e, EngineError::CapacityExceeded { max: 1, .. }), "unexpected error: {e}"),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(engine.list_executions(ExecutionQuery::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_admission_gives_the_slot_back() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], EngineConfig { max_concurrent_workflows: 1, ..test_config() }).await;
    let def = engine.register_workflow(chain("slot", &["t"]), &Actor::system()).await.unwrap();

    let err = engine.execute_workflow(Uuid::new_v4(), json!({}), ExecuteOptions::default(), &Actor::system()).await;
    assert!(matches!(err, Err(EngineError::WorkflowNotFound(_))));
    run(&engine, def.id, json!({})).await;
}

#[tokio::test]
async fn queued_execution_is_persisted_and_enqueued() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let mut def = chain("queued", &["t"]);
    def.priority = Priority::High;
    let def = engine.register_workflow(def, &Actor::system()).await.unwrap();

    let id = run(&engine, def.id, json!({"__internal": 1, "x": 2})).await;
    let exec = engine.get_execution(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Queued);
    assert_eq!(exec.input, json!({"x": 2}));
    assert!(!exec.context.trace_id.is_empty());

    let stats = engine.queue().stats().await.unwrap();
    let high = stats.iter().find(|s| s.priority == Priority::High).unwrap();
    assert_eq!(high.depth, 1);
}

#[tokio::test]
async fn invalid_input_is_rejected() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let def = engine.register_workflow(chain("in", &["t"]), &Actor::system()).await.unwrap();
    let err = engine.execute_workflow(def.id, json!([1]), ExecuteOptions::default(), &Actor::system()).await.unwrap_err();
    assert!(err.is_validation());
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chain_runs_to_completion_in_order() {
    let a = Arc::new(MockAgent::returning("a", json!({"stage": 1})));
    let b = Arc::new(MockAgent::returning("b", json!({"stage": 2})));
    let c = Arc::new(MockAgent::returning("c", json!({"stage": 3})));
    let engine = engine_with(&[("ta", a.clone()), ("tb", b.clone()), ("tc", c.clone())], test_config()).await;
    let def = engine.register_workflow(chain("abc", &["ta", "tb", "tc"]), &Actor::system()).await.unwrap();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({"x": 1})).await;
    let exec = wait_terminal(&engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let order: Vec<&str> = exec.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert!(exec.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(a.inputs(), vec![json!({"x": 1})]);
    assert_eq!(c.inputs()[0]["stage"], 2);
    assert!(exec.started_at.is_some() && exec.finished_at.is_some());

    let listed = engine
        .list_executions(ExecutionQuery { status: Some(ExecutionStatus::Completed), ..ExecutionQuery::default() })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn fatal_step_failure_fails_the_execution() {
    let bad = Arc::new(MockAgent::failing_fatal("bad", "threshold must be a number"));
    let never = Arc::new(MockAgent::returning("never", json!({})));
    let engine = engine_with(&[("bad", bad.clone()), ("never", never.clone())], test_config()).await;
    let def = engine.register_workflow(chain("fatal", &["bad", "never"]), &Actor::system()).await.unwrap();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({})).await;
    let exec = wait_terminal(&engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.error.as_deref().unwrap_or_default().contains("step 'a' failed"));
    assert_eq!(bad.call_count(), 1);
    assert_eq!(never.call_count(), 0);
    engine.stop().await;
}

#[tokio::test]
async fn retryable_failure_is_redelivered_then_dead_lettered() {
    let flaky = Arc::new(MockAgent::failing_retryable("flaky", "connection refused"));
    let engine = engine_with(&[("flaky", flaky.clone())], EngineConfig { max_retries: 1, ..test_config() }).await;
    let def = engine.register_workflow(chain("retry", &["flaky"]), &Actor::system()).await.unwrap();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({})).await;
    let exec = wait_terminal(&engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(flaky.call_count(), 2);
    assert_eq!(exec.steps.iter().map(|s| s.attempt).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(engine.queue().dead_letters(Priority::Normal).await.unwrap().len(), 1);

    // Counters are bumped right after the terminal status is persisted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = engine.metrics().await.unwrap();
    assert_eq!(metrics.retried, 1);
    assert_eq!(metrics.failed, 1);
    engine.stop().await;
}

#[tokio::test]
async fn redelivery_resumes_after_completed_steps() {
    let first = Arc::new(MockAgent::returning("first", json!({"ok": true})));
    let flaky = Arc::new(MockAgent::succeeding_after("flaky", 1, json!({"done": true})));
    let engine = engine_with(&[("first", first.clone()), ("flaky", flaky.clone())], test_config()).await;
    let def = engine.register_workflow(chain("resume", &["first", "flaky"]), &Actor::system()).await.unwrap();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({})).await;
    let exec = wait_terminal(&engine, id).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(first.call_count(), 1);
    assert_eq!(flaky.call_count(), 2);
    assert_eq!(exec.metrics.retry_count, 1);
    engine.stop().await;
}

#[tokio::test]
async fn cancelling_a_running_execution_skips_remaining_steps() {
    let slow = Arc::new(MockAgent::delayed("slow", Duration::from_millis(300), json!({})));
    let next = Arc::new(MockAgent::returning("next", json!({})));
    let engine = engine_with(&[("slow", slow.clone()), ("next", next.clone())], test_config()).await;
    let def = engine.register_workflow(chain("cancel", &["slow", "next"]), &Actor::system()).await.unwrap();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({})).await;
    wait_for(&engine, id, |e| e.status == ExecutionStatus::Running && !e.steps.is_empty()).await;

    assert!(engine.cancel_execution(id, &Actor::system()).await.unwrap());
    let exec = wait_terminal(&engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(next.call_count(), 0);
    assert_eq!(engine.get_execution(id).await.unwrap().unwrap().status, ExecutionStatus::Cancelled);
    assert!(!engine.cancel_execution(id, &Actor::system()).await.unwrap());
    engine.stop().await;
}

#[tokio::test]
async fn cancelling_a_queued_execution_frees_capacity() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent.clone())], EngineConfig { max_concurrent_workflows: 1, ..test_config() }).await;
    let def = engine.register_workflow(chain("q", &["t"]), &Actor::system()).await.unwrap();

    let id = run(&engine, def.id, json!({})).await;
    assert!(engine.cancel_execution(id, &Actor::system()).await.unwrap());
    run(&engine, def.id, json!({})).await;

    engine.start().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.get_execution(id).await.unwrap().unwrap().status, ExecutionStatus::Cancelled);
    assert_eq!(agent.call_count(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn cancel_landing_before_the_final_write_is_not_retried() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let store = Arc::new(ScriptedStore { cancel_before_complete: true, ..ScriptedStore::default() });
    let engine = engine_on(store, &[("t", agent.clone())], test_config()).await;
    let def = engine.register_workflow(chain("late-cancel", &["t"]), &Actor::system()).await.unwrap();
    let mut events = engine.subscribe();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({})).await;
    let exec = wait_terminal(&engine, id).await;
    assert_eq!(exec.status, ExecutionStatus::Cancelled);

    // Give the worker time to settle the delivery.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.call_count(), 1);
    let metrics = engine.metrics().await.unwrap();
    assert_eq!(metrics.retried, 0);
    assert_eq!(metrics.completed, 0);
    assert!(engine.queue().dead_letters(Priority::Normal).await.unwrap().is_empty());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, EngineEvent::ExecutionRetrying { .. }), "unexpected retry: {event:?}");
    }
    engine.stop().await;
}

#[tokio::test]
async fn cancel_of_unknown_execution_is_not_found() {
    let engine = engine_with(&[], test_config()).await;
    let err = engine.cancel_execution(Uuid::new_v4(), &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));
}

// ---------------------------------------------------------------------------
// Lifecycle and observability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_rejects_new_work_and_releases_resources() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let def = engine.register_workflow(chain("stop", &["t"]), &Actor::system()).await.unwrap();
    engine.start().unwrap();

    let report = engine.stop().await;
    assert_eq!(report.abandoned_executions, 0);
    assert!(engine.resources().is_empty());

    let err = engine.execute_workflow(def.id, json!({}), ExecuteOptions::default(), &Actor::system()).await.unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));
    assert!(matches!(engine.start(), Err(EngineError::ShuttingDown)));
}

#[tokio::test]
async fn monitor_releases_orphaned_idle_resources() {
    let config = EngineConfig { resource_idle_timeout: Duration::from_millis(50), ..test_config() };
    let engine = engine_with(&[], config).await;
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let cleanup: Cleanup = Box::pin(async move { flag.store(true, Ordering::SeqCst) });
    engine.resources().register(ResourceKind::Execution, Some(Uuid::new_v4()), Some(cleanup));
    engine.start().unwrap();

    let swept = async {
        while !released.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), swept).await.expect("idle resource was not released");
    assert!(engine.resources().is_empty());
    engine.stop().await;
}

#[tokio::test]
async fn metrics_snapshot_reflects_completed_work() {
    let agent = Arc::new(MockAgent::returning("t", json!({})));
    let engine = engine_with(&[("t", agent)], test_config()).await;
    let def = engine.register_workflow(chain("m", &["t", "t"]), &Actor::system()).await.unwrap();
    let mut events = engine.subscribe();
    engine.start().unwrap();

    let id = run(&engine, def.id, json!({})).await;
    let completed = async {
        loop {
            if let Ok(EngineEvent::ExecutionCompleted { execution_id, .. }) = events.recv().await {
                if execution_id == id {
                    break;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), completed).await.expect("no completion event");

    let snapshot = engine.metrics().await.unwrap();
    assert_eq!(snapshot.submitted, 1);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.error_rate, 0.0);
    assert_eq!(snapshot.queues.len(), 4);
    assert_eq!(snapshot.step_durations.iter().map(|b| b.count).sum::<u64>(), 2);
    assert!(snapshot.breakers.iter().any(|b| b.name == "agent-executor"));
    assert_eq!(snapshot.executions_by_status.get("completed"), Some(&1));
    engine.stop().await;
}
