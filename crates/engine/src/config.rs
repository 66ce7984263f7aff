//! Engine configuration and its `PLANTFLOW_*` environment overlay.

use std::str::FromStr;
use std::time::Duration;

use breaker::BreakerConfig;
use locks::LockConfig;
use pool::PoolConfig;
use queue::{Priority, QueueConfig};

use crate::EngineError;

/// Worker loops per priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub background: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self { critical: 4, high: 3, normal: 2, background: 1 }
    }
}

impl WorkerCounts {
    pub fn for_priority(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Background => self.background,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.background
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_workflows: usize,
    pub max_definitions: usize,
    pub max_steps: usize,
    /// Serialized size limit for an execution input.
    pub max_input_bytes: usize,
    pub workers: WorkerCounts,
    /// How long `stop` waits for in-flight executions.
    pub shutdown_timeout: Duration,
    pub monitor_interval: Duration,
    /// Tracked resources untouched this long are reported, and released when
    /// no running execution owns them.
    pub resource_idle_timeout: Duration,
    pub execution_lock_ttl: Duration,
    pub registration_lock_ttl: Duration,
    /// Applied when a step has no `timeout_ms`.
    pub step_timeout: Duration,
    /// Queue-level redeliveries before dead-lettering.
    pub max_retries: u32,
    /// In-process retries of a retryable step failure before the message is nacked.
    pub step_retries: u32,
    pub step_retry_base_delay: Duration,
    /// Long-poll wait of one dequeue call.
    pub dequeue_wait: Duration,
    pub cache_max_entries: usize,
    pub definition_cache_ttl: Duration,
    pub result_cache_ttl: Duration,
    pub event_capacity: usize,
    pub lock: LockConfig,
    pub breaker: BreakerConfig,
    /// Pool of storage handles.
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub agent_breaker_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 100,
            max_definitions: 1000,
            max_steps: 100,
            max_input_bytes: 1024 * 1024,
            workers: WorkerCounts::default(),
            shutdown_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
            resource_idle_timeout: Duration::from_secs(900),
            execution_lock_ttl: Duration::from_secs(600),
            registration_lock_ttl: Duration::from_secs(30),
            step_timeout: Duration::from_secs(60),
            max_retries: 3,
            step_retries: 1,
            step_retry_base_delay: Duration::from_millis(100),
            dequeue_wait: Duration::from_secs(1),
            cache_max_entries: 10_000,
            definition_cache_ttl: Duration::from_secs(300),
            result_cache_ttl: Duration::from_secs(600),
            event_capacity: 1024,
            lock: LockConfig::default(),
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
            agent_breaker_name: "agent-executor".into(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `PLANTFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each `PLANTFLOW_*` key.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, EngineError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut c = Self::default();

        env.set(&mut c.max_concurrent_workflows, "PLANTFLOW_MAX_CONCURRENT_WORKFLOWS")?;
        env.set(&mut c.max_definitions, "PLANTFLOW_MAX_DEFINITIONS")?;
        env.set(&mut c.max_steps, "PLANTFLOW_MAX_STEPS")?;
        env.set(&mut c.max_input_bytes, "PLANTFLOW_MAX_INPUT_BYTES")?;
        env.set(&mut c.workers.critical, "PLANTFLOW_WORKERS_CRITICAL")?;
        env.set(&mut c.workers.high, "PLANTFLOW_WORKERS_HIGH")?;
        env.set(&mut c.workers.normal, "PLANTFLOW_WORKERS_NORMAL")?;
        env.set(&mut c.workers.background, "PLANTFLOW_WORKERS_BACKGROUND")?;
        env.set_secs(&mut c.shutdown_timeout, "PLANTFLOW_SHUTDOWN_TIMEOUT_SECS")?;
        env.set_millis(&mut c.monitor_interval, "PLANTFLOW_MONITOR_INTERVAL_MS")?;
        env.set_secs(&mut c.resource_idle_timeout, "PLANTFLOW_RESOURCE_IDLE_TIMEOUT_SECS")?;
        env.set_secs(&mut c.execution_lock_ttl, "PLANTFLOW_EXECUTION_LOCK_TTL_SECS")?;
        env.set_secs(&mut c.registration_lock_ttl, "PLANTFLOW_REGISTRATION_LOCK_TTL_SECS")?;
        env.set_millis(&mut c.step_timeout, "PLANTFLOW_STEP_TIMEOUT_MS")?;
        env.set(&mut c.max_retries, "PLANTFLOW_MAX_RETRIES")?;
        env.set(&mut c.step_retries, "PLANTFLOW_STEP_RETRIES")?;
        env.set(&mut c.pool.min_size, "PLANTFLOW_POOL_MIN")?;
        env.set(&mut c.pool.max_size, "PLANTFLOW_POOL_MAX")?;
        env.set_secs(&mut c.queue.visibility_timeout, "PLANTFLOW_VISIBILITY_TIMEOUT_SECS")?;
        env.set(&mut c.breaker.failure_threshold, "PLANTFLOW_BREAKER_FAILURE_THRESHOLD")?;
        env.set_secs(&mut c.breaker.reset_timeout, "PLANTFLOW_BREAKER_RESET_TIMEOUT_SECS")?;

        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent_workflows == 0 {
            return Err(EngineError::Config("max_concurrent_workflows must be at least 1".into()));
        }
        if self.max_steps == 0 {
            return Err(EngineError::Config("max_steps must be at least 1".into()));
        }
        if self.workers.total() == 0 {
            return Err(EngineError::Config("at least one worker is required".into()));
        }
        if self.pool.min_size > self.pool.max_size || self.pool.max_size == 0 {
            return Err(EngineError::Config(format!(
                "pool bounds min={} max={} are invalid",
                self.pool.min_size, self.pool.max_size
            )));
        }
        Ok(())
    }
}

struct Env<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Env<L> {
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, EngineError> {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| EngineError::Config(format!("{key}: cannot parse '{raw}'"))),
        }
    }

    fn set<T: FromStr>(&self, field: &mut T, key: &str) -> Result<(), EngineError> {
        if let Some(v) = self.parse(key)? {
            *field = v;
        }
        Ok(())
    }

    fn set_secs(&self, field: &mut Duration, key: &str) -> Result<(), EngineError> {
        if let Some(v) = self.parse::<u64>(key)? {
            *field = Duration::from_secs(v);
        }
        Ok(())
    }

    fn set_millis(&self, field: &mut Duration, key: &str) -> Result<(), EngineError> {
        if let Some(v) = self.parse::<u64>(key)? {
            *field = Duration::from_millis(v);
        }
        Ok(())
    }
}
