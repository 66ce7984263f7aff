//! Execution counters and the serializable snapshot served to monitoring.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use breaker::CircuitState;
use pool::PoolStats;
use queue::QueueStats;

use crate::cache::CacheStats;
use crate::resources::ResourceCounts;

/// Upper bounds (ms) of the step duration histogram; the last bucket is open.
const STEP_BUCKETS_MS: [u64; 7] = [10, 50, 100, 500, 1_000, 5_000, 30_000];
/// Terminal executions kept for the rolling average.
const DURATION_WINDOW: usize = 100;
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    /// `None` for the overflow bucket.
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub trip_count: u64,
}

/// Point-in-time view of the engine for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Executions this process has admitted or is running.
    pub active: usize,
    pub running: usize,
    /// Messages waiting across all priority classes.
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub average_execution_ms: f64,
    pub throughput_per_minute: u64,
    pub error_rate: f64,
    pub step_durations: Vec<HistogramBucket>,
    pub breakers: Vec<BreakerStatus>,
    pub pool: PoolStats,
    pub queues: Vec<QueueStats>,
    pub cache: CacheStats,
    pub resources: ResourceCounts,
    /// Stored executions per status, across every process sharing the store.
    pub executions_by_status: BTreeMap<String, i64>,
}

/// Local counters. Other fields of the snapshot are gathered by the engine.
pub struct EngineMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    durations: Mutex<VecDeque<u64>>,
    finished_at: Mutex<VecDeque<Instant>>,
    step_buckets: [AtomicU64; STEP_BUCKETS_MS.len() + 1],
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::with_capacity(DURATION_WINDOW)),
            finished_at: Mutex::new(VecDeque::new()),
            step_buckets: Default::default(),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.record_finished(duration_ms);
    }

    pub fn record_failed(&self, duration_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_finished(duration_ms);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step(&self, duration_ms: u64) {
        let bucket = STEP_BUCKETS_MS.iter().position(|&le| duration_ms <= le).unwrap_or(STEP_BUCKETS_MS.len());
        self.step_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn record_finished(&self, duration_ms: u64) {
        let mut durations = locked(&self.durations);
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
        drop(durations);

        let now = Instant::now();
        let mut finished = locked(&self.finished_at);
        finished.push_back(now);
        while finished.front().is_some_and(|t| now.duration_since(*t) > THROUGHPUT_WINDOW) {
            finished.pop_front();
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Mean of the last executions that reached COMPLETED or FAILED.
    pub fn average_execution_ms(&self) -> f64 {
        let durations = locked(&self.durations);
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().sum::<u64>() as f64 / durations.len() as f64
    }

    /// Executions finished during the last minute.
    pub fn throughput_per_minute(&self) -> u64 {
        let now = Instant::now();
        locked(&self.finished_at)
            .iter()
            .filter(|t| now.duration_since(**t) <= THROUGHPUT_WINDOW)
            .count() as u64
    }

    /// Failed share of finished executions.
    pub fn error_rate(&self) -> f64 {
        let completed = self.completed();
        let failed = self.failed();
        if completed + failed == 0 {
            return 0.0;
        }
        failed as f64 / (completed + failed) as f64
    }

    pub fn step_histogram(&self) -> Vec<HistogramBucket> {
        self.step_buckets
            .iter()
            .enumerate()
            .map(|(i, count)| HistogramBucket {
                le_ms: STEP_BUCKETS_MS.get(i).copied(),
                count: count.load(Ordering::Relaxed),
            })
            .collect()
    }
}
