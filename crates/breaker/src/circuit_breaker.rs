//! Distributed circuit breaker.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use coord::{atomic_update, CoordError, CoordinationStore, Update};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Shared breaker state as stored under `breaker:<name>`.
///
/// Timestamps are Unix milliseconds so every process reads the same clock
/// domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    /// Probes currently admitted while half-open.
    pub half_open_calls: u32,
    pub last_failure_time: Option<i64>,
    pub last_reset_time: i64,
    pub trip_count: u64,
}

impl CircuitBreakerState {
    fn closed(now_ms: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            half_open_calls: 0,
            last_failure_time: None,
            last_reset_time: now_ms,
            trip_count: 0,
        }
    }

    fn reset_timeout_elapsed(&self, now_ms: i64, reset_timeout: Duration) -> bool {
        let since = self.last_failure_time.unwrap_or(self.last_reset_time);
        now_ms.saturating_sub(since) >= reset_timeout.as_millis() as i64
    }

    fn retry_after(&self, now_ms: i64, reset_timeout: Duration) -> Duration {
        let since = self.last_failure_time.unwrap_or(self.last_reset_time);
        let waited = now_ms.saturating_sub(since).max(0) as u64;
        Duration::from_millis((reset_timeout.as_millis() as u64).saturating_sub(waited))
    }
}

/// Tuning knobs for a breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures (consecutive while closed) that trip the breaker.
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed.
    pub reset_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_calls: u32,
    /// Probe successes needed to close again.
    pub success_threshold: u32,
    /// How long the local shadow may answer admission reads.
    pub cache_ttl: Duration,
    /// Bound on compare-and-swap retries per transition.
    pub max_update_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            success_threshold: 3,
            cache_ttl: Duration::from_secs(2),
            max_update_attempts: 16,
        }
    }
}

/// Errors from [`DistributedCircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the protected function.
    #[error("circuit breaker '{name}' is open (retry after {retry_after:?})")]
    Open { name: String, retry_after: Duration },

    /// Half-open and every probe slot is taken.
    #[error("circuit breaker '{name}' is half-open and at its probe limit")]
    HalfOpenFull { name: String },

    /// The protected function ran and failed.
    #[error("{0}")]
    Inner(E),

    /// Reading or updating the shared state failed.
    #[error("circuit breaker store error: {0}")]
    Store(#[from] CoordError),
}

impl<E> BreakerError<E> {
    /// True when the call was refused by the breaker itself.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::HalfOpenFull { .. })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Circuit breaker backed by the coordination store.
pub struct DistributedCircuitBreaker {
    name: String,
    key: String,
    store: Arc<dyn CoordinationStore>,
    config: BreakerConfig,
    shadow: Mutex<Option<(Instant, CircuitBreakerState)>>,
}

impl DistributedCircuitBreaker {
    pub fn new(name: impl Into<String>, store: Arc<dyn CoordinationStore>, config: BreakerConfig) -> Self {
        let name = name.into();
        Self {
            key: format!("breaker:{name}"),
            name,
            store,
            config,
            shadow: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match f().await {
            Ok(value) => {
                if let Err(e) = self.record_success().await {
                    warn!(breaker = %self.name, error = %e, "failed to record success");
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = self.record_failure().await {
                    warn!(breaker = %self.name, error = %e, "failed to record failure");
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let now = now_ms();
        let mut current = self.state().await?;

        if current.state == CircuitState::Open {
            if !current.reset_timeout_elapsed(now, self.config.reset_timeout) {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_after: current.retry_after(now, self.config.reset_timeout),
                });
            }
            current = self.transition_to_half_open().await?;
        }

        match current.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after: current.retry_after(now, self.config.reset_timeout),
            }),
            CircuitState::HalfOpen => self.claim_probe().await,
        }
    }

    /// Take one of the half-open probe slots.
    async fn claim_probe<E>(&self) -> Result<(), BreakerError<E>> {
        let max_calls = self.config.half_open_max_calls;
        let updated = atomic_update(
            self.store.as_ref(),
            &self.key,
            None,
            self.config.max_update_attempts,
            |cur: Option<&CircuitBreakerState>| match cur {
                Some(s) if s.state == CircuitState::HalfOpen && s.half_open_calls < max_calls => {
                    let mut next = s.clone();
                    next.half_open_calls += 1;
                    Update::Set(next)
                }
                _ => Update::Keep,
            },
        )
        .await?;

        let state = updated.value.unwrap_or_else(|| CircuitBreakerState::closed(now_ms()));
        self.remember(&state);

        if updated.applied {
            return Ok(());
        }
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(BreakerError::HalfOpenFull { name: self.name.clone() }),
            CircuitState::Open => Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after: state.retry_after(now_ms(), self.config.reset_timeout),
            }),
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) -> Result<CircuitBreakerState, CoordError> {
        let success_threshold = self.config.success_threshold;
        let updated = atomic_update(
            self.store.as_ref(),
            &self.key,
            None,
            self.config.max_update_attempts,
            |cur: Option<&CircuitBreakerState>| {
                let now = now_ms();
                let mut next = cur.cloned().unwrap_or_else(|| CircuitBreakerState::closed(now));
                next.total_requests += 1;
                match next.state {
                    CircuitState::Closed => next.failure_count = 0,
                    CircuitState::HalfOpen => {
                        next.success_count += 1;
                        next.half_open_calls = next.half_open_calls.saturating_sub(1);
                        if next.success_count >= success_threshold {
                            let trips = next.trip_count;
                            next = CircuitBreakerState::closed(now);
                            next.trip_count = trips;
                        }
                    }
                    CircuitState::Open => {}
                }
                Update::Set(next)
            },
        )
        .await?;

        let state = updated.value.unwrap_or_else(|| CircuitBreakerState::closed(now_ms()));
        if state.state == CircuitState::Closed && state.total_requests == 0 {
            info!(breaker = %self.name, "circuit closed");
        }
        self.remember(&state);
        Ok(state)
    }

    /// Record a failed call.
    pub async fn record_failure(&self) -> Result<CircuitBreakerState, CoordError> {
        let failure_threshold = self.config.failure_threshold;
        let updated = atomic_update(
            self.store.as_ref(),
            &self.key,
            None,
            self.config.max_update_attempts,
            |cur: Option<&CircuitBreakerState>| {
                let now = now_ms();
                let mut next = cur.cloned().unwrap_or_else(|| CircuitBreakerState::closed(now));
                next.total_requests += 1;
                next.failure_count += 1;
                next.last_failure_time = Some(now);
                match next.state {
                    CircuitState::Closed if next.failure_count >= failure_threshold => {
                        next.state = CircuitState::Open;
                        next.trip_count += 1;
                    }
                    CircuitState::HalfOpen => {
                        next.state = CircuitState::Open;
                        next.success_count = 0;
                        next.half_open_calls = 0;
                        next.trip_count += 1;
                    }
                    _ => {}
                }
                Update::Set(next)
            },
        )
        .await?;

        let state = updated.value.unwrap_or_else(|| CircuitBreakerState::closed(now_ms()));
        if state.state == CircuitState::Open {
            warn!(breaker = %self.name, failures = state.failure_count, "circuit open");
        }
        self.remember(&state);
        Ok(state)
    }

    /// Move Open -> HalfOpen if, and only if, the reset timeout has elapsed
    /// on the shared state. Returns the state as it stands afterwards.
    pub async fn transition_to_half_open(&self) -> Result<CircuitBreakerState, CoordError> {
        let reset_timeout = self.config.reset_timeout;
        let updated = atomic_update(
            self.store.as_ref(),
            &self.key,
            None,
            self.config.max_update_attempts,
            |cur: Option<&CircuitBreakerState>| match cur {
                Some(s) if s.state == CircuitState::Open && s.reset_timeout_elapsed(now_ms(), reset_timeout) => {
                    let mut next = s.clone();
                    next.state = CircuitState::HalfOpen;
                    next.success_count = 0;
                    next.half_open_calls = 0;
                    Update::Set(next)
                }
                _ => Update::Keep,
            },
        )
        .await?;

        if updated.applied {
            info!(breaker = %self.name, "circuit half-open");
        }
        let state = updated.value.unwrap_or_else(|| CircuitBreakerState::closed(now_ms()));
        self.remember(&state);
        Ok(state)
    }

    /// Force the breaker closed with zeroed counters.
    pub async fn reset(&self) -> Result<(), CoordError> {
        let updated = atomic_update(
            self.store.as_ref(),
            &self.key,
            None,
            self.config.max_update_attempts,
            |cur: Option<&CircuitBreakerState>| {
                let mut next = CircuitBreakerState::closed(now_ms());
                next.trip_count = cur.map_or(0, |s| s.trip_count);
                Update::Set(next)
            },
        )
        .await?;
        if let Some(state) = updated.value {
            self.remember(&state);
        }
        info!(breaker = %self.name, "circuit manually reset");
        Ok(())
    }

    /// State for admission decisions: the local shadow when fresh, the store otherwise.
    pub async fn state(&self) -> Result<CircuitBreakerState, CoordError> {
        if let Some(state) = self.shadowed() {
            return Ok(state);
        }
        self.snapshot().await
    }

    /// Authoritative read from the store, refreshing the shadow.
    pub async fn snapshot(&self) -> Result<CircuitBreakerState, CoordError> {
        let state = coord::get_json::<CircuitBreakerState>(self.store.as_ref(), &self.key)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::closed(now_ms()));
        self.remember(&state);
        Ok(state)
    }

    fn shadowed(&self) -> Option<CircuitBreakerState> {
        let guard = self.shadow.lock().ok()?;
        match guard.as_ref() {
            Some((at, state)) if at.elapsed() < self.config.cache_ttl => Some(state.clone()),
            _ => None,
        }
    }

    fn remember(&self, state: &CircuitBreakerState) {
        if let Ok(mut guard) = self.shadow.lock() {
            *guard = Some((Instant::now(), state.clone()));
        }
        debug!(breaker = %self.name, state = %state.state, "breaker state observed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker_on(store: Arc<dyn CoordinationStore>, reset: Duration) -> DistributedCircuitBreaker {
        DistributedCircuitBreaker::new(
            "agent-executor",
            store,
            BreakerConfig { reset_timeout: reset, cache_ttl: Duration::ZERO, ..BreakerConfig::default() },
        )
    }

    async fn fail(b: &DistributedCircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &DistributedCircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn trips_after_threshold_and_fails_fast() {
        let b = breaker_on(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        for _ in 0..5 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(b.snapshot().await.unwrap().state, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let res: Result<(), BreakerError<&str>> = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_while_closed_resets_consecutive_failures() {
        let b = breaker_on(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        succeed(&b).await.unwrap();
        let _ = fail(&b).await;
        let s = b.snapshot().await.unwrap();
        assert_eq!(s.state, CircuitState::Closed);
        assert_eq!(s.failure_count, 1);
    }

    #[tokio::test]
    async fn half_open_probes_close_after_three_successes() {
        let b = breaker_on(Arc::new(MemoryStore::new()), Duration::from_millis(50));
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        succeed(&b).await.unwrap();
        let s = b.snapshot().await.unwrap();
        assert_eq!(s.state, CircuitState::HalfOpen);
        assert_eq!(s.success_count, 1);

        succeed(&b).await.unwrap();
        succeed(&b).await.unwrap();
        let s = b.snapshot().await.unwrap();
        assert_eq!(s.state, CircuitState::Closed);
        assert_eq!(s.failure_count, 0);
        assert_eq!(s.success_count, 0);
        assert_eq!(s.total_requests, 0);
        assert_eq!(s.half_open_calls, 0);
        assert_eq!(s.trip_count, 1);
    }

    #[tokio::test]
    async fn failure_while_half_open_reopens_immediately() {
        let b = breaker_on(Arc::new(MemoryStore::new()), Duration::from_millis(50));
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        let s = b.snapshot().await.unwrap();
        assert_eq!(s.state, CircuitState::Open);
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn state_is_shared_between_instances() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let a = breaker_on(store.clone(), Duration::from_secs(60));
        let b = breaker_on(store, Duration::from_secs(60));

        for _ in 0..5 {
            let _ = fail(&a).await;
        }
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn only_one_process_moves_open_to_half_open() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let a = breaker_on(store.clone(), Duration::from_millis(20));
        let b = breaker_on(store, Duration::from_millis(20));
        for _ in 0..5 {
            let _ = a.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        a.transition_to_half_open().await.unwrap();
        a.claim_probe::<()>().await.unwrap();
        // The second process sees half-open and must not reset the probe count.
        let s = b.transition_to_half_open().await.unwrap();
        assert_eq!(s.state, CircuitState::HalfOpen);
        assert_eq!(s.half_open_calls, 1);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let b = DistributedCircuitBreaker::new(
            "limited",
            Arc::new(MemoryStore::new()),
            BreakerConfig {
                reset_timeout: Duration::from_millis(10),
                half_open_max_calls: 1,
                cache_ttl: Duration::ZERO,
                ..BreakerConfig::default()
            },
        );
        for _ in 0..5 {
            let _ = b.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        b.admit::<()>().await.unwrap();
        assert!(matches!(b.admit::<()>().await, Err(BreakerError::HalfOpenFull { .. })));
    }

    #[tokio::test]
    async fn reset_closes_an_open_breaker() {
        let b = breaker_on(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        b.reset().await.unwrap();
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().await.unwrap().state, CircuitState::Closed);
    }
}
