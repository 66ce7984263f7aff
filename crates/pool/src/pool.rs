//! Generic connection pool with FIFO waiters and idle eviction.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{PoolError, PoolResult};

/// Knows how to open, check and close one pooled resource.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> PoolResult<Self::Connection>;

    /// Health probe used by test-on-borrow / test-on-return.
    async fn validate(&self, _conn: &mut Self::Connection) -> bool {
        true
    }

    async fn destroy(&self, _conn: Self::Connection) {}
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub eviction_interval: Duration,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(30),
            test_on_borrow: false,
            test_on_return: false,
        }
    }
}

/// One pooled resource and its bookkeeping. Only the pool writes the flags.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: Uuid,
    handle: C,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    healthy: bool,
}

impl<C> PooledConnection<C> {
    fn new(handle: C) -> Self {
        let now = Instant::now();
        Self { id: Uuid::new_v4(), handle, created_at: now, last_used: now, in_use: false, healthy: true }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Point-in-time pool utilisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
    pub timeouts: u64,
}

struct State<C> {
    idle: VecDeque<PooledConnection<C>>,
    /// Connections in existence, including ones being created.
    total: usize,
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<PooledConnection<C>>>,
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<State<F::Connection>>,
    draining: AtomicBool,
    released: Notify,
    created: AtomicU64,
    destroyed: AtomicU64,
    timeouts: AtomicU64,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

enum Checkout<C> {
    Ready(PooledConnection<C>),
    Create,
    Wait(oneshot::Receiver<PooledConnection<C>>),
}

/// A `total` slot taken for a connection that is still being created.
/// Dropping it unfinished gives the slot back.
struct Reservation<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<F> {
    fn new(shared: Arc<Shared<F>>) -> Self {
        Self { shared, armed: true }
    }

    fn fulfil(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let starving = {
            let mut state = self.shared.state();
            state.total = state.total.saturating_sub(1);
            state.waiters.retain(|w| !w.is_closed());
            !state.waiters.is_empty()
        };
        self.shared.released.notify_waiters();
        if starving {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let shared = self.shared.clone();
                runtime.spawn(async move { shared.replenish().await });
            }
        }
    }
}

/// A place in the wait line. A connection handed to a waiter that gave up
/// before receiving it goes back to the pool.
struct Waiter<F: ConnectionFactory> {
    rx: oneshot::Receiver<PooledConnection<F::Connection>>,
    shared: Arc<Shared<F>>,
    settled: bool,
}

impl<F: ConnectionFactory> Waiter<F> {
    async fn recv(&mut self, deadline: Instant) -> PoolResult<PooledConnection<F::Connection>> {
        let received = tokio::time::timeout_at(deadline, &mut self.rx).await;
        self.settled = true;
        match received {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(PoolError::Draining),
            Err(_) => {
                // A release may have raced the deadline.
                self.rx.close();
                match self.rx.try_recv() {
                    Ok(conn) => Ok(conn),
                    Err(_) => {
                        self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                        Err(PoolError::Timeout(self.shared.config.acquire_timeout))
                    }
                }
            }
        }
    }
}

impl<F: ConnectionFactory> Drop for Waiter<F> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(conn) = self.rx.try_recv() {
            debug!(connection = %conn.id, "waiter gone, returning its connection");
            if self.shared.checkin(conn).is_some() {
                self.shared.destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<F: ConnectionFactory> Shared<F> {
    fn state(&self) -> MutexGuard<'_, State<F::Connection>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Give `conn` to the oldest live waiter, or park it as idle.
    fn hand_off(state: &mut State<F::Connection>, mut conn: PooledConnection<F::Connection>) {
        while let Some(waiter) = state.waiters.pop_front() {
            conn.in_use = true;
            match waiter.send(conn) {
                Ok(()) => {
                    state.in_use += 1;
                    return;
                }
                Err(returned) => conn = returned,
            }
        }
        conn.in_use = false;
        state.idle.push_back(conn);
    }

    /// Return a healthy connection. Yields it back when the pool is draining
    /// so the caller can destroy it.
    fn checkin(&self, mut conn: PooledConnection<F::Connection>) -> Option<PooledConnection<F::Connection>> {
        conn.last_used = Instant::now();
        let leftover = {
            let mut state = self.state();
            state.in_use = state.in_use.saturating_sub(1);
            if self.is_draining() {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            } else {
                Self::hand_off(&mut state, conn);
                None
            }
        };
        self.released.notify_waiters();
        leftover
    }

    async fn destroy(&self, conn: PooledConnection<F::Connection>) {
        debug!(connection = %conn.id, "destroying pooled connection");
        self.factory.destroy(conn.handle).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a checked-out connection and top the pool back up in the background.
    async fn discard(self: &Arc<Self>, conn: PooledConnection<F::Connection>) {
        {
            let mut state = self.state();
            state.in_use = state.in_use.saturating_sub(1);
            state.total = state.total.saturating_sub(1);
        }
        self.destroy(conn).await;
        self.released.notify_waiters();

        let shared = self.clone();
        tokio::spawn(async move { shared.replenish().await });
    }

    async fn give_back(self: &Arc<Self>, mut conn: PooledConnection<F::Connection>) {
        let valid = conn.healthy && (!self.config.test_on_return || self.factory.validate(&mut conn.handle).await);
        if !valid {
            warn!(connection = %conn.id, "connection failed validation on return");
            self.discard(conn).await;
            return;
        }
        if let Some(conn) = self.checkin(conn) {
            self.destroy(conn).await;
        }
    }

    /// Create connections until `min_size` is met and no live waiter is starving.
    async fn replenish(self: &Arc<Self>) {
        loop {
            {
                let mut state = self.state();
                state.waiters.retain(|w| !w.is_closed());
                let wanted = state.total < self.config.min_size || !state.waiters.is_empty();
                if self.is_draining() || !wanted || state.total >= self.config.max_size {
                    return;
                }
                state.total += 1;
            }
            match self.factory.create().await {
                Ok(handle) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    let mut state = self.state();
                    Self::hand_off(&mut state, PooledConnection::new(handle));
                }
                Err(e) => {
                    self.state().total -= 1;
                    warn!(error = %e, "failed to replenish pool");
                    return;
                }
            }
        }
    }

    async fn evict_idle(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let victims = {
            let mut state = self.state();
            let mut removable = state.total.saturating_sub(self.config.min_size);
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut victims = Vec::new();
            while let Some(conn) = state.idle.pop_front() {
                if removable > 0 && now.duration_since(conn.last_used) >= self.config.idle_timeout {
                    removable -= 1;
                    victims.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            state.idle = keep;
            state.total -= victims.len();
            victims
        };

        let evicted = victims.len();
        for conn in victims {
            self.destroy(conn).await;
        }
        if evicted > 0 {
            debug!(evicted, "evicted idle connections");
        }
        self.replenish().await;
        evicted
    }
}

/// Bounded pool of connections produced by `F`.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Build the pool, open `min_size` connections and start the eviction sweep.
    pub async fn new(factory: F, config: PoolConfig) -> PoolResult<Self> {
        if config.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if config.min_size > config.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size {} exceeds max_size {}",
                config.min_size, config.max_size
            )));
        }

        let shared = Arc::new(Shared {
            factory,
            config,
            state: Mutex::new(State { idle: VecDeque::new(), total: 0, in_use: 0, waiters: VecDeque::new() }),
            draining: AtomicBool::new(false),
            released: Notify::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            eviction: Mutex::new(None),
        });

        for _ in 0..shared.config.min_size {
            let handle = shared.factory.create().await?;
            shared.created.fetch_add(1, Ordering::Relaxed);
            let mut state = shared.state();
            state.total += 1;
            state.idle.push_back(PooledConnection::new(handle));
        }

        let task = spawn_eviction(&shared);
        if let Ok(mut slot) = shared.eviction.lock() {
            *slot = Some(task);
        }
        info!(min = shared.config.min_size, max = shared.config.max_size, "connection pool ready");
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_draining(&self) -> bool {
        self.shared.is_draining()
    }

    /// Borrow a connection: idle first, then a new one under `max_size`,
    /// then wait in line until one is released or the acquire timeout hits.
    pub async fn acquire(&self) -> PoolResult<PooledConn<F>> {
        let deadline = Instant::now() + self.shared.config.acquire_timeout;
        loop {
            if self.shared.is_draining() {
                return Err(PoolError::Draining);
            }
            let step = {
                let mut state = self.shared.state();
                if let Some(conn) = state.idle.pop_front() {
                    state.in_use += 1;
                    Checkout::Ready(conn)
                } else if state.total < self.shared.config.max_size {
                    state.total += 1;
                    Checkout::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Checkout::Wait(rx)
                }
            };

            let (conn, fresh) = match step {
                Checkout::Ready(conn) => (conn, false),
                Checkout::Create => (self.create_checked_out().await?, true),
                Checkout::Wait(rx) => {
                    let mut waiter = Waiter { rx, shared: self.shared.clone(), settled: false };
                    (waiter.recv(deadline).await?, false)
                }
            };

            if let Some(guard) = self.checkout(conn, fresh).await {
                return Ok(guard);
            }
        }
    }

    /// Borrow without waiting. `None` when the pool is exhausted.
    pub async fn try_acquire(&self) -> PoolResult<Option<PooledConn<F>>> {
        loop {
            if self.shared.is_draining() {
                return Err(PoolError::Draining);
            }
            let step = {
                let mut state = self.shared.state();
                if let Some(conn) = state.idle.pop_front() {
                    state.in_use += 1;
                    Checkout::Ready(conn)
                } else if state.total < self.shared.config.max_size {
                    state.total += 1;
                    Checkout::Create
                } else {
                    return Ok(None);
                }
            };
            let (conn, fresh) = match step {
                Checkout::Ready(conn) => (conn, false),
                _ => (self.create_checked_out().await?, true),
            };
            if let Some(guard) = self.checkout(conn, fresh).await {
                return Ok(Some(guard));
            }
        }
    }

    /// Open a connection for a `total` slot the caller already took.
    async fn create_checked_out(&self) -> PoolResult<PooledConnection<F::Connection>> {
        let reservation = Reservation::new(self.shared.clone());
        let handle = self.shared.factory.create().await?;
        reservation.fulfil();
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        self.shared.state().in_use += 1;
        Ok(PooledConnection::new(handle))
    }

    /// Validate reused connections on borrow when configured; `None` means
    /// the connection was discarded.
    async fn checkout(&self, mut conn: PooledConnection<F::Connection>, fresh: bool) -> Option<PooledConn<F>> {
        conn.in_use = true;
        conn.last_used = Instant::now();
        // Wrapped first so a caller dropped mid-probe still checks it back in.
        let mut guard = PooledConn { conn: Some(conn), shared: self.shared.clone() };
        if fresh || !self.shared.config.test_on_borrow {
            return Some(guard);
        }
        let valid = match guard.conn.as_mut() {
            Some(conn) => self.shared.factory.validate(&mut conn.handle).await,
            None => false,
        };
        if !valid {
            if let Some(conn) = guard.conn.take() {
                warn!(connection = %conn.id, "connection failed validation on borrow");
                self.shared.discard(conn).await;
            }
            return None;
        }
        Some(guard)
    }

    /// Return a connection, validating it first when `test_on_return` is set.
    pub async fn release(&self, mut conn: PooledConn<F>) {
        if let Some(inner) = conn.conn.take() {
            self.shared.give_back(inner).await;
        }
    }

    /// Destroy idle connections above `min_size` that outlived `idle_timeout`,
    /// then top back up to `min_size`. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        self.shared.evict_idle().await
    }

    /// Stop handing out connections, wait up to `timeout` for borrowed ones to
    /// come back, then destroy everything idle. Returns the number of
    /// connections still borrowed when the wait gave up; those are destroyed
    /// as they are returned.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.state().waiters.clear();

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.released.notified();
            if self.shared.state().in_use == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let idle: Vec<_> = {
            let mut state = self.shared.state();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        for conn in idle {
            self.shared.destroy(conn).await;
        }
        if let Ok(mut slot) = self.shared.eviction.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let abandoned = self.shared.state().in_use;
        if abandoned > 0 {
            warn!(abandoned, "pool drain timed out with connections still borrowed");
        } else {
            info!("connection pool drained");
        }
        abandoned
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.in_use,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            min_size: self.shared.config.min_size,
            max_size: self.shared.config.max_size,
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
        }
    }
}

fn spawn_eviction<F: ConnectionFactory>(shared: &Arc<Shared<F>>) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let every = shared.config.eviction_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            if shared.is_draining() {
                break;
            }
            shared.evict_idle().await;
        }
    })
}

/// A borrowed connection. Goes back to the pool on [`ConnectionPool::release`]
/// or when dropped.
pub struct PooledConn<F: ConnectionFactory> {
    conn: Option<PooledConnection<F::Connection>>,
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> PooledConn<F> {
    pub fn id(&self) -> Uuid {
        self.inner().id
    }

    /// Flag the connection as broken so it is destroyed instead of reused.
    pub fn mark_unhealthy(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.healthy = false;
        }
    }

    fn inner(&self) -> &PooledConnection<F::Connection> {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConn<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.inner().handle
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConn<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => &mut conn.handle,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConn<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };

        if !conn.healthy || self.shared.config.test_on_return {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let shared = self.shared.clone();
                runtime.spawn(async move { shared.give_back(conn).await });
                return;
            }
            if !conn.healthy {
                let mut state = self.shared.state();
                state.in_use = state.in_use.saturating_sub(1);
                state.total = state.total.saturating_sub(1);
                self.shared.destroyed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.shared.checkin(conn).is_some() {
            self.shared.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
