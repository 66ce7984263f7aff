//! Workflow engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. `register_workflow` validates a definition and persists it under a
//!    per-definition distributed lock.
//! 2. `execute_workflow` admits an execution, persists it, and enqueues it on
//!    its priority class. Either both happen or neither.
//! 3. Worker loops (one set per priority class) dequeue executions and drive
//!    them through [`WorkflowExecutor`], persisting every step.
//! 4. Retryable failures are nacked back onto the queue; exhausted retries
//!    dead-letter the message and fail the execution.
//! 5. `stop` drains in-flight work within a bounded timeout, then tears down
//!    workers, the storage pool and every tracked resource.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agents::builtin::{default_registry, Collaborators};
use agents::{AgentExecutor, AgentRegistry};
use breaker::BreakerRegistry;
use coord::{CoordinationStore, MemoryStore};
use db::{DbError, ExecutionFilter, InMemoryStorage, WorkflowRow, WorkflowStore};
use locks::{DistributedLock, Lock};
use pool::ConnectionPool;
use queue::{MessageQueue, NackOutcome, Priority, QueueMessage};

use crate::auth::{Actor, AllowAll, Authorizer, Permission};
use crate::cache::WorkflowCache;
use crate::config::EngineConfig;
use crate::dag::validate_dag;
use crate::events::{EngineEvent, EventBus};
use crate::executor::{ExecutionObserver, ExecutorConfig, RunOutcome, WorkflowExecutor};
use crate::input::sanitize_input;
use crate::metrics::{BreakerStatus, EngineMetrics, MetricsSnapshot};
use crate::models::{
    ExecutionPayload, ExecutionStatus, RequestContext, StepExecution, StepStatus, WorkflowDefinition, WorkflowExecution,
};
use crate::resources::{Cleanup, ResourceKind, ResourceManager};
use crate::storage::{StorageFactory, StoragePool};
use crate::{EngineError, EngineResult};

/// Upper bound for each best-effort cleanup during `stop`.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(25);

fn execution_resource(id: Uuid) -> String {
    format!("execution:{id}")
}

fn workflow_resource(id: Uuid) -> String {
    format!("workflow:{id}")
}

/// Serializes first-time registrations so the definition cap holds across ids.
const DEFINITIONS_RESOURCE: &str = "workflow:definitions";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Optional knobs for `execute_workflow`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Caller-chosen id. A second call with the same id is rejected.
    pub execution_id: Option<Uuid>,
    pub context: RequestContext,
    /// Overrides the definition's priority class.
    pub priority: Option<Priority>,
}

/// Filter for `list_executions`. Newest first.
#[derive(Debug, Clone)]
pub struct ExecutionQuery {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self { workflow_id: None, status: None, limit: 50, offset: 0 }
    }
}

/// What `stop` had to abandon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Executions still running when the shutdown timeout fired.
    pub abandoned_executions: usize,
    /// Storage handles still borrowed when the pool drain gave up.
    pub abandoned_connections: usize,
    /// Resource-manager entries force-released.
    pub released_resources: usize,
}

// ---------------------------------------------------------------------------
// Active execution tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    /// Capacity reserved, record and message not written yet.
    Admitting,
    Queued,
    Running,
}

struct ActiveExecution {
    state: Tracked,
    cancel: CancellationToken,
    since: Instant,
}

/// How a delivery ends for the queue.
enum Disposition {
    Completed,
    Failed,
    Cancelled,
    /// Nothing to do (record missing or already terminal).
    Skip,
    Retry(String),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires the engine's collaborators. Anything left unset gets an in-memory default.
#[derive(Default)]
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    coordination: Option<Arc<dyn CoordinationStore>>,
    storage: Option<Arc<dyn WorkflowStore>>,
    agents: Option<AgentRegistry>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl WorkflowEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn coordination(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.coordination = Some(store);
        self
    }

    pub fn storage(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.storage = Some(store);
        self
    }

    pub fn agents(mut self, registry: AgentRegistry) -> Self {
        self.agents = Some(registry);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub async fn build(self) -> EngineResult<WorkflowEngine> {
        let config = self.config;
        config.validate()?;

        let coord = self.coordination.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let storage = self.storage.unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let registry = self.agents.unwrap_or_else(|| default_registry(&Collaborators::default()));

        let breakers = Arc::new(BreakerRegistry::new(coord.clone(), config.breaker.clone()));
        let agent_executor = Arc::new(AgentExecutor::new(
            registry,
            &breakers,
            agents::ExecutorConfig { default_timeout: config.step_timeout, breaker_name: config.agent_breaker_name.clone() },
        ));
        let cache = Arc::new(WorkflowCache::new(
            config.cache_max_entries,
            config.definition_cache_ttl,
            config.result_cache_ttl,
        ));
        let executor = WorkflowExecutor::new(
            agent_executor,
            cache.clone(),
            ExecutorConfig {
                step_timeout: config.step_timeout,
                step_retries: config.step_retries,
                retry_base_delay: config.step_retry_base_delay,
            },
        );
        let pool = ConnectionPool::new(StorageFactory::new(storage), config.pool.clone()).await?;

        let inner = EngineInner {
            locks: Arc::new(DistributedLock::single(coord.clone(), config.lock.clone())),
            queue: MessageQueue::new(coord, config.queue.clone()),
            breakers,
            executor,
            pool,
            cache,
            resources: Arc::new(ResourceManager::new()),
            metrics: EngineMetrics::new(),
            events: EventBus::new(config.event_capacity),
            authorizer: self.authorizer.unwrap_or_else(|| Arc::new(AllowAll)),
            active: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            draining: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        };
        Ok(WorkflowEngine { inner: Arc::new(inner) })
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    locks: Arc<DistributedLock>,
    breakers: Arc<BreakerRegistry>,
    queue: MessageQueue,
    executor: WorkflowExecutor,
    pool: StoragePool,
    cache: Arc<WorkflowCache>,
    resources: Arc<ResourceManager>,
    metrics: EngineMetrics,
    events: EventBus,
    authorizer: Arc<dyn Authorizer>,
    /// Advisory: executions this process admitted or is running.
    active: Mutex<HashMap<Uuid, ActiveExecution>>,
    started: AtomicBool,
    /// Fires when `stop` begins; workers stop taking new messages.
    draining: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.inner.queue
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.is_cancelled()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Validate and persist a definition. Re-registering identical content is a
    /// no-op; changed content is stored as the next version.
    #[instrument(skip(self, definition, actor), fields(workflow_id = %definition.id, actor = %actor.id))]
    pub async fn register_workflow(&self, definition: WorkflowDefinition, actor: &Actor) -> EngineResult<WorkflowDefinition> {
        let inner = &self.inner;
        inner
            .authorizer
            .require_permission(actor, Permission::WorkflowRegister, &workflow_resource(definition.id))
            .await?;
        inner.ensure_accepting()?;
        inner.validate_definition(&definition)?;

        let id = definition.id;
        let stored = inner
            .locks
            .with_lock(&workflow_resource(id), inner.config.registration_lock_ttl, || inner.persist_definition(definition))
            .await??;

        inner.cache.put_definition(stored.clone()).await;
        info!(
            target: "audit",
            actor = %actor.id,
            action = "workflow.register",
            resource = %id,
            version = stored.version,
            "workflow registered"
        );
        inner.events.emit(EngineEvent::WorkflowRegistered { workflow_id: id, version: stored.version });
        Ok(stored)
    }

    /// Latest version, cache first.
    pub async fn get_workflow(&self, id: Uuid) -> EngineResult<Option<WorkflowDefinition>> {
        match self.inner.load_definition(id).await {
            Ok(def) => Ok(Some(def.as_ref().clone())),
            Err(EngineError::WorkflowNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_workflows(&self, limit: i64, offset: i64) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = self.inner.with_storage(None, move |s| async move { s.list_definitions(limit, offset).await }).await?;
        rows.iter().map(WorkflowDefinition::from_row).collect()
    }

    /// Definition whose triggers include `Webhook { path }`.
    pub async fn workflow_for_webhook(&self, path: &str) -> EngineResult<Option<WorkflowDefinition>> {
        let limit = self.inner.config.max_definitions as i64;
        Ok(self.list_workflows(limit, 0).await?.into_iter().find(|d| d.has_webhook(path)))
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Admit an execution and return its id. The run itself happens on a worker.
    #[instrument(skip(self, input, options, actor), fields(actor = %actor.id))]
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        input: Value,
        options: ExecuteOptions,
        actor: &Actor,
    ) -> EngineResult<Uuid> {
        let inner = &self.inner;
        inner
            .authorizer
            .require_permission(actor, Permission::WorkflowExecute, &workflow_resource(workflow_id))
            .await?;
        inner.ensure_accepting()?;
        let input = sanitize_input(input, inner.config.max_input_bytes)?;
        let execution_id = options.execution_id.unwrap_or_else(Uuid::new_v4);

        inner.reserve_slot(execution_id)?;
        match inner.submit(workflow_id, execution_id, input, options).await {
            Ok(priority) => {
                inner.mark_queued(execution_id);
                inner.metrics.record_submitted();
                info!(
                    target: "audit",
                    actor = %actor.id,
                    action = "workflow.execute",
                    resource = %workflow_id,
                    execution_id = %execution_id,
                    "execution queued"
                );
                inner.events.emit(EngineEvent::WorkflowQueued { execution_id, workflow_id, priority });
                Ok(execution_id)
            }
            Err(e) => {
                inner.release_slot(execution_id);
                Err(e)
            }
        }
    }

    /// Mark an active execution CANCELLED. Returns `false` if it had already finished.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn cancel_execution(&self, execution_id: Uuid, actor: &Actor) -> EngineResult<bool> {
        let inner = &self.inner;
        inner
            .authorizer
            .require_permission(actor, Permission::ExecutionCancel, &execution_resource(execution_id))
            .await?;

        let mut execution = inner.load_execution(execution_id).await?.ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.transition(ExecutionStatus::Cancelled)?;
        match inner.save(&execution).await {
            Ok(()) => {}
            // Finished in between.
            Err(EngineError::Database(DbError::Conflict(_))) => return Ok(false),
            Err(e) => return Err(e),
        }

        inner.cancel_local(execution_id);
        let released = inner.resources.release_owner(execution_id).await;
        inner.metrics.record_cancelled();
        info!(
            target: "audit",
            actor = %actor.id,
            action = "execution.cancel",
            resource = %execution_id,
            released,
            "execution cancelled"
        );
        inner.events.emit(EngineEvent::ExecutionCancelled { execution_id });
        Ok(true)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> EngineResult<Option<WorkflowExecution>> {
        self.inner.load_execution(execution_id).await
    }

    pub async fn list_executions(&self, query: ExecutionQuery) -> EngineResult<Vec<WorkflowExecution>> {
        let filter = ExecutionFilter {
            workflow_id: query.workflow_id,
            status: query.status.map(|s| s.as_str().to_string()),
            limit: query.limit.clamp(1, 500),
            offset: query.offset.max(0),
        };
        let rows = self.inner.with_storage(None, move |s| async move { s.list_executions(&filter).await }).await?;
        rows.iter().map(WorkflowExecution::from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub async fn metrics(&self) -> EngineResult<MetricsSnapshot> {
        let inner = &self.inner;
        let (active, running) = {
            let tracker = inner.tracker();
            (tracker.len(), tracker.values().filter(|a| a.state == Tracked::Running).count())
        };
        let queues = inner.queue.stats().await?;
        let executions_by_status =
            inner.with_storage(None, |s| async move { s.count_executions_by_status().await }).await?;
        let breakers = inner
            .breakers
            .snapshots()
            .await?
            .into_iter()
            .map(|(name, s)| BreakerStatus { name, state: s.state, failure_count: s.failure_count, trip_count: s.trip_count })
            .collect();

        Ok(MetricsSnapshot {
            active,
            running,
            queued: queues.iter().map(|q| q.depth).sum(),
            submitted: inner.metrics.submitted(),
            completed: inner.metrics.completed(),
            failed: inner.metrics.failed(),
            cancelled: inner.metrics.cancelled(),
            retried: inner.metrics.retried(),
            average_execution_ms: inner.metrics.average_execution_ms(),
            throughput_per_minute: inner.metrics.throughput_per_minute(),
            error_rate: inner.metrics.error_rate(),
            step_durations: inner.metrics.step_histogram(),
            breakers,
            pool: inner.pool.stats(),
            queues,
            cache: inner.cache.stats().await,
            resources: inner.resources.counts(),
            executions_by_status: executions_by_status.into_iter().collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the worker loops and the monitor. Idempotent.
    pub fn start(&self) -> EngineResult<()> {
        let inner = &self.inner;
        inner.ensure_accepting()?;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = inner.task_list();
        for priority in Priority::ALL {
            for worker in 0..inner.config.workers.for_priority(priority) {
                let engine = inner.clone();
                tasks.push(tokio::spawn(async move { engine.worker_loop(priority, worker).await }));
            }
        }
        let engine = inner.clone();
        tasks.push(tokio::spawn(async move { engine.monitor_loop().await }));

        info!(workers = inner.config.workers.total(), "workflow engine started");
        inner.events.emit(EngineEvent::EngineStarted);
        Ok(())
    }

    /// Graceful shutdown. Waits up to `shutdown_timeout` for running executions,
    /// then cancels the rest and tears everything down. Never fails.
    pub async fn stop(&self) -> ShutdownReport {
        let inner = &self.inner;
        if inner.draining.is_cancelled() {
            return ShutdownReport::default();
        }
        inner.draining.cancel();
        info!(running = inner.running_count(), "workflow engine draining");

        let deadline = Instant::now() + inner.config.shutdown_timeout;
        while inner.running_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let abandoned_executions = inner.running_count();
        if abandoned_executions > 0 {
            warn!(abandoned = abandoned_executions, "shutdown timeout reached, abandoning running executions");
            for active in inner.tracker().values() {
                active.cancel.cancel();
            }
        }

        let tasks: Vec<JoinHandle<()>> = inner.task_list().drain(..).collect();
        for task in tasks {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "engine task panicked");
                }
            }
        }

        let abandoned_connections = inner.pool.drain(CLEANUP_TIMEOUT).await;
        let released_resources = inner.resources.shutdown(CLEANUP_TIMEOUT).await;
        inner.tracker().clear();
        inner.started.store(false, Ordering::SeqCst);

        info!(abandoned_executions, abandoned_connections, released_resources, "workflow engine stopped");
        inner.events.emit(EngineEvent::EngineStopped);
        ShutdownReport { abandoned_executions, abandoned_connections, released_resources }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl EngineInner {
    fn ensure_accepting(&self) -> EngineResult<()> {
        if self.draining.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    fn tracker(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveExecution>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn task_list(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn active_count(&self) -> usize {
        self.tracker().len()
    }

    fn running_count(&self) -> usize {
        self.tracker().values().filter(|a| a.state == Tracked::Running).count()
    }

    /// Check the concurrency ceiling and take a slot in one critical section.
    fn reserve_slot(&self, id: Uuid) -> EngineResult<()> {
        let max = self.config.max_concurrent_workflows;
        let mut tracker = self.tracker();
        if tracker.contains_key(&id) {
            return Err(EngineError::DuplicateExecution(id));
        }
        if tracker.len() >= max {
            return Err(EngineError::CapacityExceeded { active: tracker.len(), max });
        }
        tracker.insert(id, ActiveExecution { state: Tracked::Admitting, cancel: CancellationToken::new(), since: Instant::now() });
        Ok(())
    }

    /// Admission finished. A worker may already have moved the entry on.
    fn mark_queued(&self, id: Uuid) {
        if let Some(active) = self.tracker().get_mut(&id) {
            if active.state == Tracked::Admitting {
                active.state = Tracked::Queued;
                active.since = Instant::now();
            }
        }
    }

    fn release_slot(&self, id: Uuid) {
        let mut tracker = self.tracker();
        if tracker.get(&id).is_some_and(|a| a.state == Tracked::Admitting) {
            tracker.remove(&id);
        }
    }

    fn track_running(&self, id: Uuid) -> CancellationToken {
        let mut tracker = self.tracker();
        let entry = tracker.entry(id).or_insert_with(|| ActiveExecution {
            state: Tracked::Running,
            cancel: CancellationToken::new(),
            since: Instant::now(),
        });
        entry.state = Tracked::Running;
        entry.since = Instant::now();
        entry.cancel.clone()
    }

    fn untrack(&self, id: Uuid) {
        self.tracker().remove(&id);
    }

    fn cancel_local(&self, id: Uuid) {
        let mut tracker = self.tracker();
        let running = match tracker.get(&id) {
            Some(active) => {
                active.cancel.cancel();
                active.state == Tracked::Running
            }
            None => return,
        };
        // A running entry is removed by its worker.
        if !running {
            tracker.remove(&id);
        }
    }

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------

    /// Run `f` against a pooled storage handle registered with the resource manager.
    async fn with_storage<T, F, Fut>(&self, owner: Option<Uuid>, f: F) -> EngineResult<T>
    where
        F: FnOnce(Arc<dyn WorkflowStore>) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut conn = self.pool.acquire().await?;
        let guard = self.resources.guard(ResourceKind::Connection, owner, None);
        let result = f(conn.shared()).await;
        guard.complete();
        if matches!(result, Err(DbError::Sqlx(_))) {
            conn.mark_unhealthy();
        }
        self.pool.release(conn).await;
        Ok(result?)
    }

    async fn save(&self, execution: &WorkflowExecution) -> EngineResult<()> {
        let row = execution.to_row()?;
        self.with_storage(Some(execution.id), move |s| async move { s.update_execution(&row).await }).await
    }

    async fn load_execution(&self, id: Uuid) -> EngineResult<Option<WorkflowExecution>> {
        let row = self.with_storage(Some(id), move |s| async move { s.get_execution(id).await }).await?;
        row.as_ref().map(WorkflowExecution::from_row).transpose()
    }

    /// Latest version, cache first.
    async fn load_definition(&self, id: Uuid) -> EngineResult<Arc<WorkflowDefinition>> {
        if let Some(def) = self.cache.definition(id).await {
            return Ok(def);
        }
        let row = self
            .with_storage(None, move |s| async move { s.get_definition(id).await })
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))?;
        Ok(self.cache.put_definition(WorkflowDefinition::from_row(&row)?).await)
    }

    /// The exact version an execution was admitted against.
    async fn load_definition_version(&self, id: Uuid, version: u32) -> EngineResult<Arc<WorkflowDefinition>> {
        if let Some(def) = self.cache.definition(id).await {
            if def.version == version {
                return Ok(def);
            }
        }
        let row = self
            .with_storage(None, move |s| async move { s.get_definition_version(id, version as i32).await })
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))?;
        Ok(Arc::new(WorkflowDefinition::from_row(&row)?))
    }

    // -----------------------------------------------------------------------
    // Registration internals
    // -----------------------------------------------------------------------

    fn validate_definition(&self, definition: &WorkflowDefinition) -> EngineResult<()> {
        if definition.name.trim().is_empty() {
            return Err(EngineError::InvalidDefinition("name must not be empty".into()));
        }
        if definition.steps.is_empty() {
            return Err(EngineError::InvalidDefinition("workflow has no steps".into()));
        }
        if definition.steps.len() > self.config.max_steps {
            return Err(EngineError::TooManySteps { count: definition.steps.len(), max: self.config.max_steps });
        }
        let registry = self.executor.agents().registry();
        if let Some(step) = definition.steps.iter().find(|s| !registry.contains(&s.agent_type)) {
            return Err(EngineError::InvalidDefinition(format!(
                "step '{}' uses unknown agent type '{}'",
                step.id, step.agent_type
            )));
        }
        validate_dag(definition)?;
        Ok(())
    }

    /// Runs under the registration lock.
    async fn persist_definition(&self, mut definition: WorkflowDefinition) -> EngineResult<WorkflowDefinition> {
        let id = definition.id;
        let existing = self.with_storage(None, move |s| async move { s.get_definition(id).await }).await?;

        match existing {
            Some(row) => {
                let current = WorkflowDefinition::from_row(&row)?;
                if current.same_content(&definition) {
                    debug!(workflow_id = %id, version = current.version, "definition unchanged");
                    return Ok(current);
                }
                definition.version = definition.version.max(current.version + 1);
                definition.created_at = current.created_at;
            }
            None => {
                let row = definition.to_row()?;
                let stored = self
                    .locks
                    .with_lock(DEFINITIONS_RESOURCE, self.config.registration_lock_ttl, || self.insert_new_definition(row))
                    .await??;
                return WorkflowDefinition::from_row(&stored);
            }
        }

        let row = definition.to_row()?;
        let stored = self.with_storage(None, move |s| async move { s.upsert_definition(&row).await }).await?;
        WorkflowDefinition::from_row(&stored)
    }

    /// Runs under the definitions lock.
    async fn insert_new_definition(&self, row: WorkflowRow) -> EngineResult<WorkflowRow> {
        let count = self.with_storage(None, |s| async move { s.count_definitions().await }).await?;
        if count as usize >= self.config.max_definitions {
            return Err(EngineError::DefinitionLimit { max: self.config.max_definitions });
        }
        self.with_storage(None, move |s| async move { s.upsert_definition(&row).await }).await
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Load the definition, take the execution lock and admit. The lock is
    /// released again when admission fails.
    async fn submit(
        &self,
        workflow_id: Uuid,
        execution_id: Uuid,
        input: Value,
        options: ExecuteOptions,
    ) -> EngineResult<Priority> {
        let definition = self.load_definition(workflow_id).await?;
        let mut context = options.context;
        if context.trace_id.is_empty() {
            context.trace_id = Uuid::new_v4().to_string();
        }

        let lock = self
            .locks
            .try_acquire(&execution_resource(execution_id), self.config.execution_lock_ttl)
            .await?
            .ok_or(EngineError::DuplicateExecution(execution_id))?;

        let admitted = self.admit(&definition, execution_id, input, context, options.priority, &lock).await;
        if admitted.is_err() {
            if let Err(e) = self.locks.release(&lock).await {
                warn!(execution_id = %execution_id, error = %e, "failed to release execution lock");
            }
        }
        admitted
    }

    /// Persist the execution and enqueue it. Deletes the record again if the
    /// enqueue fails, so either both exist or neither does.
    async fn admit(
        &self,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        input: Value,
        context: RequestContext,
        priority: Option<Priority>,
        lock: &Lock,
    ) -> EngineResult<Priority> {
        let mut execution = WorkflowExecution::new(execution_id, definition, input, context);
        if let Some(priority) = priority {
            execution.priority = priority;
        }

        let row = execution.to_row()?;
        match self.with_storage(Some(execution_id), move |s| async move { s.insert_execution(&row).await }).await {
            Ok(()) => {}
            Err(EngineError::Database(DbError::Conflict(_))) => return Err(EngineError::DuplicateExecution(execution_id)),
            Err(e) => return Err(e),
        }

        let payload = ExecutionPayload {
            execution_id,
            workflow_id: definition.id,
            workflow_version: definition.version,
            input: execution.input.clone(),
            context: execution.context.clone(),
            lock_token: Some(lock.token.clone()),
        };
        let message = QueueMessage::new(execution.priority, serde_json::to_value(&payload)?)
            .with_trace_id(execution.context.trace_id.clone())
            .with_max_retries(self.config.max_retries);

        if let Err(e) = self.queue.enqueue(message).await {
            error!(execution_id = %execution_id, error = %e, "enqueue failed, removing execution record");
            if let Err(cleanup) = self.with_storage(None, move |s| async move { s.delete_execution(execution_id).await }).await {
                error!(execution_id = %execution_id, error = %cleanup, "failed to remove orphaned execution record");
            }
            return Err(e.into());
        }
        Ok(execution.priority)
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, priority: Priority, worker: usize) {
        debug!(%priority, worker, "worker started");
        loop {
            let delivery = tokio::select! {
                _ = self.draining.cancelled() => break,
                d = self.queue.dequeue(priority, self.config.dequeue_wait) => d,
            };
            match delivery {
                Ok(Some(message)) => self.process_message(message).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(%priority, worker, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = self.draining.cancelled() => break,
                        _ = tokio::time::sleep(self.config.dequeue_wait) => {}
                    }
                }
            }
        }
        debug!(%priority, worker, "worker stopped");
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, queue = %message.priority))]
    async fn process_message(&self, message: QueueMessage) {
        let payload: ExecutionPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "undecodable message payload");
                if let Err(e) = self.queue.nack(message.id, false, Some(format!("undecodable payload: {e}"))).await {
                    warn!(error = %e, "failed to dead-letter message");
                }
                return;
            }
        };
        let execution_id = payload.execution_id;
        let cancel = self.track_running(execution_id);

        let cleanup: Option<Cleanup> = payload.lock_token.clone().map(|token| {
            let locks = self.locks.clone();
            let lock = Lock::from_parts(execution_resource(execution_id), token, self.config.execution_lock_ttl);
            Box::pin(async move {
                if let Err(e) = locks.release(&lock).await {
                    warn!(execution_id = %lock.resource, error = %e, "failed to release execution lock");
                }
            }) as Cleanup
        });
        let guard = self.resources.guard(ResourceKind::Execution, Some(execution_id), cleanup);

        let disposition = match self.run_execution(&message, &payload, &cancel, guard.id()).await {
            Ok(d) => d,
            // The record went terminal underneath the worker (cancelled elsewhere).
            Err(EngineError::Database(DbError::Conflict(reason))) => {
                debug!(execution_id = %execution_id, %reason, "execution changed underneath the worker");
                Disposition::Cancelled
            }
            Err(e) if !e.is_validation() && message.metadata.retry_count == 0 => {
                warn!(execution_id = %execution_id, error = %e, "unexpected error, retrying once");
                Disposition::Retry(e.to_string())
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "execution failed unexpectedly");
                self.fail_execution(execution_id, e.to_string()).await;
                Disposition::Failed
            }
        };

        self.settle(&message, execution_id, disposition).await;
        self.untrack(execution_id);
        guard.release().await;
    }

    /// Ack or nack the delivery.
    async fn settle(&self, message: &QueueMessage, execution_id: Uuid, disposition: Disposition) {
        match disposition {
            Disposition::Retry(error) => match self.queue.nack(message.id, true, Some(error.clone())).await {
                Ok(NackOutcome::Requeued(retry_count)) => {
                    self.metrics.record_retry();
                    info!(execution_id = %execution_id, retry_count, "execution requeued");
                    self.events.emit(EngineEvent::ExecutionRetrying { execution_id, retry_count });
                }
                Ok(NackOutcome::DeadLettered) => self.fail_execution(execution_id, error).await,
                Err(e) => warn!(execution_id = %execution_id, error = %e, "nack failed"),
            },
            Disposition::Completed | Disposition::Failed | Disposition::Cancelled | Disposition::Skip => {
                if let Err(e) = self.queue.ack(message.id).await {
                    warn!(execution_id = %execution_id, error = %e, "ack failed");
                }
            }
        }
    }

    async fn run_execution(
        &self,
        message: &QueueMessage,
        payload: &ExecutionPayload,
        cancel: &CancellationToken,
        resource: Uuid,
    ) -> EngineResult<Disposition> {
        let execution_id = payload.execution_id;
        let Some(mut execution) = self.load_execution(execution_id).await? else {
            warn!(execution_id = %execution_id, "execution record missing, dropping message");
            return Ok(Disposition::Skip);
        };
        if execution.status.is_terminal() {
            debug!(execution_id = %execution_id, status = %execution.status, "execution already finished");
            return Ok(Disposition::Skip);
        }

        let definition = self.load_definition_version(payload.workflow_id, payload.workflow_version).await?;
        execution.metrics.retry_count = message.metadata.retry_count;
        if execution.status == ExecutionStatus::Queued {
            execution.transition(ExecutionStatus::Running)?;
            self.save(&execution).await?;
            self.events.emit(EngineEvent::ExecutionStarted { execution_id });
        }

        let observer = PersistingObserver { inner: self, message, resource };
        let outcome = self.executor.run(&definition, &mut execution, cancel, &observer).await?;

        match outcome {
            RunOutcome::Completed { .. } => {
                execution.transition(ExecutionStatus::Completed)?;
                self.save(&execution).await?;
                let duration_ms = execution.metrics.execution_time_ms.unwrap_or(0);
                self.metrics.record_completed(duration_ms);
                info!(execution_id = %execution_id, duration_ms, "execution completed");
                self.events.emit(EngineEvent::ExecutionCompleted { execution_id, duration_ms });
                Ok(Disposition::Completed)
            }
            RunOutcome::Cancelled => {
                execution.transition(ExecutionStatus::Cancelled)?;
                match self.save(&execution).await {
                    Ok(()) | Err(EngineError::Database(DbError::Conflict(_))) => {}
                    Err(e) => return Err(e),
                }
                info!(execution_id = %execution_id, "execution cancelled");
                Ok(Disposition::Cancelled)
            }
            RunOutcome::Failed { step_id, error } => {
                let message = format!("step '{step_id}' failed: {error}");
                if error.is_retryable() {
                    return Ok(Disposition::Retry(message));
                }
                execution.error = Some(message.clone());
                execution.transition(ExecutionStatus::Failed)?;
                self.save(&execution).await?;
                self.record_failure(&execution, message);
                Ok(Disposition::Failed)
            }
        }
    }

    /// Best effort: move the execution to FAILED with `error` attached.
    async fn fail_execution(&self, execution_id: Uuid, error: String) {
        let result = async {
            let Some(mut execution) = self.load_execution(execution_id).await? else {
                return Ok(());
            };
            if execution.status.is_terminal() {
                return Ok(());
            }
            if execution.status == ExecutionStatus::Queued {
                execution.transition(ExecutionStatus::Running)?;
            }
            execution.error = Some(error.clone());
            execution.transition(ExecutionStatus::Failed)?;
            self.save(&execution).await?;
            self.record_failure(&execution, error.clone());
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = result {
            error!(execution_id = %execution_id, error = %e, "could not mark execution failed");
        }
    }

    fn record_failure(&self, execution: &WorkflowExecution, error: String) {
        self.metrics.record_failed(execution.metrics.execution_time_ms.unwrap_or(0));
        warn!(execution_id = %execution.id, %error, "execution failed");
        self.events.emit(EngineEvent::ExecutionFailed { execution_id: execution.id, error });
    }

    // -----------------------------------------------------------------------
    // Monitor
    // -----------------------------------------------------------------------

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.draining.cancelled() => break,
                _ = tokio::time::sleep(self.config.monitor_interval) => {}
            }
            self.monitor_tick().await;
        }
    }

    async fn monitor_tick(&self) {
        match self.queue.requeue_expired().await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "reclaimed expired deliveries"),
            Err(e) => warn!(error = %e, "visibility sweep failed"),
        }
        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            debug!(purged, "purged expired cache entries");
        }

        // Queued entries may have been picked up and finished by another process.
        let stale: Vec<Uuid> = self
            .tracker()
            .iter()
            .filter(|(_, a)| a.state == Tracked::Queued && a.since.elapsed() >= self.config.monitor_interval)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            match self.load_execution(id).await {
                Ok(Some(execution)) if !execution.status.is_terminal() => {}
                Ok(_) => {
                    let mut tracker = self.tracker();
                    if tracker.get(&id).is_some_and(|a| a.state == Tracked::Queued) {
                        tracker.remove(&id);
                    }
                }
                Err(e) => warn!(execution_id = %id, error = %e, "could not refresh tracked execution"),
            }
        }

        self.sweep_idle_resources().await;

        debug!(
            active = self.active_count(),
            running = self.running_count(),
            resources = self.resources.len(),
            "monitor tick"
        );
    }

    /// Release idle entries whose owner is not running here; only report the rest.
    async fn sweep_idle_resources(&self) {
        for idle in self.resources.idle_for(self.config.resource_idle_timeout) {
            let owner_running = idle
                .owner
                .is_some_and(|owner| self.tracker().get(&owner).is_some_and(|a| a.state == Tracked::Running));
            let idle_ms = idle.idle.as_millis() as u64;
            if owner_running {
                warn!(resource_id = %idle.id, kind = ?idle.kind, owner = ?idle.owner, idle_ms, "resource idle while its execution runs");
                continue;
            }
            warn!(resource_id = %idle.id, kind = ?idle.kind, owner = ?idle.owner, idle_ms, "releasing orphaned idle resource");
            self.resources.release(idle.id).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Step persistence
// ---------------------------------------------------------------------------

/// Step records keep the rendered `AgentError`; recover its class from the prefix.
fn retryable_step_error(error: &str) -> bool {
    ["retryable agent error", "agent timed out", "circuit breaker"]
        .iter()
        .any(|prefix| error.starts_with(prefix))
}

struct PersistingObserver<'a> {
    inner: &'a EngineInner,
    message: &'a QueueMessage,
    /// Resource-manager entry of the execution, touched on progress.
    resource: Uuid,
}

#[async_trait]
impl ExecutionObserver for PersistingObserver<'_> {
    async fn step_started(&self, execution: &WorkflowExecution) -> EngineResult<()> {
        self.inner.resources.touch(self.resource);
        self.inner.save(execution).await?;
        if let Err(e) = self.inner.queue.extend_visibility(self.message.id, self.message.priority).await {
            warn!(execution_id = %execution.id, error = %e, "failed to extend message visibility");
        }
        Ok(())
    }

    async fn step_finished(&self, execution: &WorkflowExecution, record: &StepExecution) -> EngineResult<()> {
        self.inner.resources.touch(self.resource);
        self.inner.save(execution).await?;
        let duration_ms = record.duration_ms.unwrap_or(0);
        match record.status {
            StepStatus::Completed => {
                if !record.cached {
                    self.inner.metrics.record_step(duration_ms);
                }
                self.inner.events.emit(EngineEvent::StepCompleted {
                    execution_id: execution.id,
                    step_id: record.step_id.clone(),
                    duration_ms,
                    cached: record.cached,
                });
            }
            StepStatus::Failed => {
                self.inner.metrics.record_step(duration_ms);
                let error = record.error.clone().unwrap_or_default();
                let retryable = retryable_step_error(&error);
                self.inner.events.emit(EngineEvent::StepFailed {
                    execution_id: execution.id,
                    step_id: record.step_id.clone(),
                    error,
                    retryable,
                });
            }
            StepStatus::Running => {}
        }
        Ok(())
    }
}
