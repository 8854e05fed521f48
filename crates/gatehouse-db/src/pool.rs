use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionFactory, DriverKind};
use crate::error::DbError;

/// Settings for one named pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub driver: DriverKind,
    pub host: String,
    pub port: u16,
    /// Schema name, or the file path for SQLite.
    pub database: String,
    pub username: String,
    pub password: String,
    /// Connect timeout, and the longest `acquire` waits for a free slot.
    pub connection_timeout: Duration,
    pub query_timeout: Duration,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::MySql,
            host: "127.0.0.1".into(),
            port: 3306,
            database: "account".into(),
            username: "root".into(),
            password: String::new(),
            connection_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(60),
            min_pool_size: 1,
            max_pool_size: 10,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), DbError> {
        if self.max_pool_size == 0 || self.min_pool_size > self.max_pool_size {
            return Err(DbError::PoolMisconfigured {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }
        Ok(())
    }
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub current_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
    pub timeouts: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool={} total={} active={} idle={} size={} [{}..{}] created={} destroyed={} timeouts={}",
            self.name,
            self.total,
            self.active,
            self.idle,
            self.current_size,
            self.min_size,
            self.max_size,
            self.created,
            self.destroyed,
            self.timeouts
        )
    }
}

struct PoolState {
    /// Oldest-used at the front. `acquire` pops from the back.
    idle: VecDeque<Connection>,
    active: usize,
    /// Live connections plus slots reserved for connects in flight.
    total: usize,
    /// Idle connections kept on release. Always within `[min, max]`.
    current_size: usize,
    closed: bool,
}

/// Lets background threads sleep until their next tick or shutdown.
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleep for `interval`. True once stop has been signalled.
    fn wait(&self, interval: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (stopped, _) = self
            .cv
            .wait_timeout_while(stopped, interval, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_all();
    }
}

/// Bounded pool of database connections.
///
/// One mutex guards the idle list and counters; `active` and `total` are
/// mirrored into atomics for lock-free status reads. Connects, pings and
/// closes all happen outside the lock.
pub struct ConnectionPool {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    available: Condvar,
    active: AtomicUsize,
    total: AtomicUsize,
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    timeouts: AtomicU64,
    shut_down: AtomicBool,
    stop: Arc<StopSignal>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Validate the config, open `min_pool_size` connections and start the
    /// cleanup and health-check threads.
    pub fn initialize(
        name: &str,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Arc<Self>, DbError> {
        config.validate()?;

        let pool = Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_pool_size),
                active: 0,
                total: 0,
                current_size: config.min_pool_size,
                closed: false,
            }),
            config,
            factory,
            available: Condvar::new(),
            active: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            stop: Arc::new(StopSignal::new()),
            workers: Mutex::new(Vec::new()),
        });

        let mut initial = Vec::with_capacity(pool.config.min_pool_size);
        for _ in 0..pool.config.min_pool_size {
            initial.push(pool.open_connection()?);
        }
        {
            let mut state = pool.lock_state();
            state.total = initial.len();
            state.idle.extend(initial);
            pool.sync_counters(&state);
        }

        let cleanup_every = pool.config.cleanup_interval;
        let health_every = pool.config.health_check_interval;
        pool.spawn_worker("cleanup", cleanup_every, |pool| {
            let evicted = pool.cleanup_idle();
            if evicted > 0 {
                debug!(pool = %pool.name, evicted, "Idle connections closed");
            }
        });
        pool.spawn_worker("health", health_every, |pool| {
            let replaced = pool.check_health();
            if replaced > 0 {
                warn!(pool = %pool.name, replaced, "Dead idle connections replaced");
            }
        });

        info!(
            pool = %pool.name,
            min = pool.config.min_pool_size,
            max = pool.config.max_pool_size,
            "Connection pool initialized"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take a connection: newest idle first, else a fresh one while under
    /// `max_pool_size`, else wait up to `connection_timeout`.
    pub fn acquire(&self) -> Result<Connection, DbError> {
        let timeout = self.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(DbError::ShuttingDown);
            }

            if let Some(mut conn) = state.idle.pop_back() {
                state.active += 1;
                self.sync_counters(&state);
                drop(state);
                conn.touch();
                return Ok(conn);
            }

            if state.total < self.config.max_pool_size {
                state.total += 1;
                state.active += 1;
                state.current_size = state.current_size.max(state.total);
                self.sync_counters(&state);
                drop(state);

                return match self.open_connection() {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        let mut state = self.lock_state();
                        state.total = state.total.saturating_sub(1);
                        state.active = state.active.saturating_sub(1);
                        self.sync_counters(&state);
                        drop(state);
                        self.available.notify_one();
                        warn!(pool = %self.name, "Connect during acquire failed: {}", e);
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %self.name, ?timeout, "Timed out waiting for a connection");
                return Err(DbError::PoolExhausted(timeout));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Hand a connection back. Open transactions are rolled back; dead
    /// connections and connections beyond the current size are closed.
    pub fn release(&self, mut conn: Connection) {
        let healthy = !self.shut_down.load(Ordering::Acquire) && conn.is_healthy();

        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);
        if healthy && !state.closed && state.idle.len() < state.current_size {
            conn.touch();
            state.idle.push_back(conn);
            self.sync_counters(&state);
            drop(state);
            self.available.notify_one();
            return;
        }

        state.total = state.total.saturating_sub(1);
        self.sync_counters(&state);
        drop(state);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, conn = conn.id(), healthy, "Connection discarded on release");
        drop(conn);
        self.available.notify_one();
    }

    /// Acquire with a guard that releases on drop.
    pub fn get(&self) -> Result<PooledConnection<'_>, DbError> {
        let conn = self.acquire()?;
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
        })
    }

    /// Run `f` on a pooled connection, releasing it afterwards.
    pub fn with_connection<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T>,
    {
        let mut conn = self.get()?;
        f(&mut *conn)
    }

    /// Set the number of connections the pool keeps. Growing connects the
    /// missing connections now; shrinking closes idle connections beyond the
    /// new size and lets busy ones be discarded on release.
    pub fn set_pool_size(&self, size: usize) -> bool {
        let (min, max) = (self.config.min_pool_size, self.config.max_pool_size);
        if size < min || size > max {
            warn!(pool = %self.name, size, min, max, "Pool size out of bounds");
            return false;
        }

        let mut state = self.lock_state();
        if state.closed {
            return false;
        }

        if size <= state.current_size {
            let mut closing = Vec::new();
            while state.idle.len() > size {
                if let Some(conn) = state.idle.pop_front() {
                    closing.push(conn);
                    state.total -= 1;
                }
            }
            state.current_size = size;
            self.sync_counters(&state);
            drop(state);
            self.destroyed.fetch_add(closing.len() as u64, Ordering::Relaxed);
            info!(pool = %self.name, size, closed = closing.len(), "Pool shrunk");
            return true;
        }

        let needed = size.saturating_sub(state.total);
        state.total += needed;
        state.current_size = size;
        self.sync_counters(&state);
        drop(state);

        let mut made = Vec::with_capacity(needed);
        let mut failure = None;
        for _ in 0..needed {
            match self.open_connection() {
                Ok(conn) => made.push(conn),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut state = self.lock_state();
        state.total -= needed - made.len();
        if state.closed {
            state.total = state.total.saturating_sub(made.len());
            self.sync_counters(&state);
            return false;
        }
        state.idle.extend(made);
        if failure.is_some() {
            state.current_size = state.total.clamp(min, max);
        }
        self.sync_counters(&state);
        let current = state.current_size;
        drop(state);
        self.available.notify_all();

        match failure {
            Some(e) => {
                warn!(pool = %self.name, requested = size, current, "Pool grow failed: {}", e);
                false
            }
            None => {
                info!(pool = %self.name, size, "Pool grown");
                true
            }
        }
    }

    pub fn increase_pool_size(&self, delta: usize) -> bool {
        self.set_pool_size(self.pool_size().saturating_add(delta))
    }

    pub fn decrease_pool_size(&self, delta: usize) -> bool {
        self.set_pool_size(self.pool_size().saturating_sub(delta))
    }

    pub fn resize_pool(&self, size: usize) -> bool {
        self.set_pool_size(size)
    }

    /// Current target size.
    pub fn pool_size(&self) -> usize {
        self.lock_state().current_size
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total_connections(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn idle_connections(&self) -> usize {
        self.lock_state().idle.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            name: self.name.clone(),
            total: state.total,
            active: state.active,
            idle: state.idle.len(),
            current_size: state.current_size,
            min_size: self.config.min_pool_size,
            max_size: self.config.max_pool_size,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Close connections idle for at least `idle_timeout`, never going
    /// below `min_pool_size`. Returns how many were closed.
    pub(crate) fn cleanup_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let min = self.config.min_pool_size;

        let mut state = self.lock_state();
        if state.closed {
            return 0;
        }
        let mut expired = Vec::new();
        while state.total > min && state.idle.front().is_some_and(|c| c.idle_for() >= timeout) {
            if let Some(conn) = state.idle.pop_front() {
                expired.push(conn);
                state.total -= 1;
            }
        }
        state.current_size = state.current_size.min(state.total.max(min));
        self.sync_counters(&state);
        drop(state);

        self.destroyed.fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Ping every idle connection and replace the ones that fail.
    /// Returns how many failed.
    pub(crate) fn check_health(&self) -> usize {
        let checking: Vec<Connection> = {
            let mut state = self.lock_state();
            if state.closed {
                return 0;
            }
            state.idle.drain(..).collect()
        };

        let mut healthy = Vec::with_capacity(checking.len());
        let mut dead = 0;
        for mut conn in checking {
            if conn.ping() {
                healthy.push(conn);
            } else {
                debug!(pool = %self.name, conn = conn.id(), "Idle connection failed ping");
                dead += 1;
            }
        }
        if dead == 0 && healthy.is_empty() {
            return 0;
        }

        let mut replacements = Vec::with_capacity(dead);
        for _ in 0..dead {
            match self.open_connection() {
                Ok(conn) => replacements.push(conn),
                Err(e) => {
                    warn!(pool = %self.name, "Replacing dead connection failed: {}", e);
                    break;
                }
            }
        }
        self.destroyed.fetch_add(dead as u64, Ordering::Relaxed);

        let mut state = self.lock_state();
        state.total -= dead - replacements.len();
        if state.closed {
            state.total = state.total.saturating_sub(healthy.len() + replacements.len());
            self.sync_counters(&state);
            return dead;
        }
        let newer = std::mem::take(&mut state.idle);
        state.idle.extend(healthy);
        state.idle.extend(replacements);
        state.idle.extend(newer);
        self.sync_counters(&state);
        drop(state);
        self.available.notify_all();
        dead
    }

    /// Close the pool: wake every waiter, stop and join the background
    /// threads, and close idle connections. Connections still held are
    /// closed when released. Only the first call does anything.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let stats = self.stats();
        self.stop.stop();

        let idle: Vec<Connection> = {
            let mut state = self.lock_state();
            state.closed = true;
            state.active = 0;
            state.total = 0;
            state.current_size = 0;
            self.sync_counters(&state);
            state.idle.drain(..).collect()
        };
        self.available.notify_all();

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let me = thread::current().id();
        for worker in workers {
            if worker.thread().id() == me {
                continue;
            }
            if worker.join().is_err() {
                error!(pool = %self.name, "Pool worker thread panicked");
            }
        }

        self.destroyed.fetch_add(idle.len() as u64, Ordering::Relaxed);
        drop(idle);
        info!("Connection pool shut down: {}", stats);
    }

    fn open_connection(&self) -> Result<Connection, DbError> {
        let driver = self.factory.connect(&self.config)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, conn = id, "Connection opened");
        Ok(Connection::new(id, driver))
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync_counters(&self, state: &PoolState) {
        self.active.store(state.active, Ordering::Release);
        self.total.store(state.total, Ordering::Release);
    }

    fn spawn_worker(self: &Arc<Self>, task_name: &str, interval: Duration, task: fn(&ConnectionPool)) {
        let weak: Weak<ConnectionPool> = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, task_name))
            .spawn(move || {
                while !stop.wait(interval) {
                    match weak.upgrade() {
                        Some(pool) => task(&pool),
                        None => break,
                    }
                }
            });
        match spawned {
            Ok(handle) => self
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle),
            Err(e) => error!(pool = %self.name, task = task_name, "Failed to start pool worker: {}", e),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// A connection that goes back to its pool when dropped.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Dialect, Driver, Row, Value};

    struct MockDriver {
        alive: Arc<AtomicBool>,
    }

    impl Driver for MockDriver {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn ping(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64, DbError> {
            if self.ping() { Ok(0) } else { Err(DbError::Query("gone away".into())) }
        }

        fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, DbError> {
            Ok(Vec::new())
        }

        fn last_insert_id(&mut self) -> Option<i64> {
            None
        }
    }

    /// Hands out mock drivers. Every driver opened since the last `kill_all`
    /// shares one liveness flag.
    struct MockFactory {
        alive: Mutex<Arc<AtomicBool>>,
        budget: AtomicUsize,
        opened: AtomicUsize,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                alive: Mutex::new(Arc::new(AtomicBool::new(true))),
                budget: AtomicUsize::new(usize::MAX),
                opened: AtomicUsize::new(0),
            })
        }

        fn kill_all(&self) {
            let mut alive = self.alive.lock().unwrap();
            alive.store(false, Ordering::SeqCst);
            *alive = Arc::new(AtomicBool::new(true));
        }

        fn allow(&self, connects: usize) {
            self.budget.store(connects, Ordering::SeqCst);
        }
    }

    impl ConnectionFactory for MockFactory {
        fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn Driver>, DbError> {
            let allowed = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(DbError::Connect("refused".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::clone(&self.alive.lock().unwrap());
            Ok(Box::new(MockDriver { alive }))
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_pool_size: min,
            max_pool_size: max,
            connection_timeout: Duration::from_millis(200),
            cleanup_interval: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(3600),
            ..PoolConfig::default()
        }
    }

    fn pool(min: usize, max: usize) -> (Arc<ConnectionPool>, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let pool = ConnectionPool::initialize("test", config(min, max), factory.clone()).unwrap();
        (pool, factory)
    }

    fn assert_consistent(pool: &ConnectionPool) {
        let stats = pool.stats();
        assert_eq!(stats.total, stats.active + stats.idle, "{}", stats);
        assert!(stats.total <= stats.max_size, "{}", stats);
        assert!(stats.current_size >= stats.min_size, "{}", stats);
        assert!(stats.current_size <= stats.max_size, "{}", stats);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let factory = MockFactory::new();
        let err = ConnectionPool::initialize("bad", config(3, 2), factory.clone()).err().unwrap();
        assert!(matches!(err, DbError::PoolMisconfigured { min: 3, max: 2 }));
        let err = ConnectionPool::initialize("bad", config(0, 0), factory.clone()).err().unwrap();
        assert!(matches!(err, DbError::PoolMisconfigured { .. }));
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_precreates_min_connections() {
        let (pool, factory) = pool(2, 4);
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        pool.shutdown();
    }

    #[test]
    fn test_initialize_fails_when_connect_fails() {
        let factory = MockFactory::new();
        factory.allow(1);
        let err = ConnectionPool::initialize("down", config(2, 4), factory).err().unwrap();
        assert!(matches!(err, DbError::Connect(_)));
    }

    #[test]
    fn test_exhaustion_times_out() {
        let (pool, _) = pool(1, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.active_connections(), 2);

        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted(_)));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(pool.stats().timeouts, 1);

        pool.release(a);
        pool.release(b);
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let factory = MockFactory::new();
        let cfg = PoolConfig {
            connection_timeout: Duration::from_secs(5),
            ..config(1, 1)
        };
        let pool = ConnectionPool::initialize("wake", cfg, factory).unwrap();
        let held = pool.acquire().unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let started = Instant::now();
                let conn = pool.acquire().unwrap();
                let id = conn.id();
                pool.release(conn);
                (id, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        pool.release(held);

        let (id, waited) = waiter.join().unwrap();
        assert_eq!(id, held_id);
        assert!(waited < Duration::from_secs(5));
        pool.shutdown();
    }

    #[test]
    fn test_lifo_reuse() {
        let (pool, _) = pool(3, 3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let (a_id, c_id) = (a.id(), c.id());

        pool.release(a);
        pool.release(c);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(first.id(), c_id);
        assert_eq!(second.id(), a_id);

        for conn in [first, second, b] {
            pool.release(conn);
        }
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_acquire_grows_to_max() {
        let (pool, factory) = pool(1, 3);
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 3);
        assert_eq!(pool.pool_size(), 3);
        for conn in held {
            pool.release(conn);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.destroyed, 0);
        pool.shutdown();
    }

    #[test]
    fn test_unhealthy_release_is_destroyed() {
        let (pool, factory) = pool(1, 2);
        let conn = pool.acquire().unwrap();
        factory.kill_all();
        pool.release(conn);

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.destroyed, 1);

        let fresh = pool.acquire().unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        pool.release(fresh);
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_open_transaction_rolled_back_on_release() {
        let (pool, _) = pool(1, 1);
        let mut conn = pool.acquire().unwrap();
        conn.begin_transaction().unwrap();
        assert!(conn.in_transaction());
        let id = conn.id();
        pool.release(conn);

        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), id);
        assert!(!conn.in_transaction());
        pool.release(conn);
        pool.shutdown();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (pool, _) = pool(1, 2);
        {
            let mut conn = pool.get().unwrap();
            assert!(conn.ping());
            assert_eq!(pool.active_connections(), 1);
        }
        assert_eq!(pool.active_connections(), 0);
        let answer = pool.with_connection(|conn| Ok(conn.execute("SELECT 1", &[])?)).unwrap();
        assert_eq!(answer, 0);
        assert_eq!(pool.active_connections(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_resize_down_and_up() {
        let (pool, _) = pool(1, 5);
        assert!(pool.set_pool_size(4));
        assert_eq!(pool.stats().idle, 4);
        assert_eq!(pool.pool_size(), 4);

        assert!(pool.set_pool_size(2));
        assert_eq!(pool.total_connections(), 2);
        assert_eq!(pool.idle_connections(), 2);

        assert!(pool.increase_pool_size(2));
        assert_eq!(pool.total_connections(), 4);
        assert!(pool.decrease_pool_size(3));
        assert_eq!(pool.total_connections(), 1);
        assert!(pool.resize_pool(3));
        assert_eq!(pool.pool_size(), 3);

        assert!(!pool.set_pool_size(6));
        assert!(!pool.set_pool_size(0));
        assert_eq!(pool.pool_size(), 3);
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_failed_grow_keeps_what_was_made() {
        let (pool, factory) = pool(1, 5);
        factory.allow(2);
        assert!(!pool.set_pool_size(5));
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.current_size, 3);
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_shrink_discards_busy_connections_on_release() {
        let (pool, _) = pool(1, 3);
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.set_pool_size(1));
        for conn in held {
            pool.release(conn);
        }
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 2);
        pool.shutdown();
    }

    #[test]
    fn test_shrink_keeps_idle_within_new_size() {
        let (pool, _) = pool(1, 6);
        assert!(pool.set_pool_size(6));
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();

        assert!(pool.set_pool_size(3));
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.active, 3);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.destroyed, 0);
        assert_consistent(&pool);

        for conn in held {
            pool.release(conn);
        }
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.destroyed, 3);
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_cleanup_keeps_minimum() {
        let factory = MockFactory::new();
        let cfg = PoolConfig {
            idle_timeout: Duration::ZERO,
            ..config(1, 4)
        };
        let pool = ConnectionPool::initialize("idle", cfg, factory).unwrap();
        assert!(pool.set_pool_size(4));

        assert_eq!(pool.cleanup_idle(), 3);
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.current_size, 1);
        assert_eq!(pool.cleanup_idle(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_cleanup_ignores_recent_connections() {
        let (pool, _) = pool(1, 4);
        assert!(pool.set_pool_size(3));
        assert_eq!(pool.cleanup_idle(), 0);
        assert_eq!(pool.total_connections(), 3);
        pool.shutdown();
    }

    #[test]
    fn test_health_check_replaces_dead_connections() {
        let (pool, factory) = pool(2, 4);
        assert_eq!(pool.check_health(), 0);

        factory.kill_all();
        assert_eq!(pool.check_health(), 2);
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.destroyed, 2);

        let mut conn = pool.acquire().unwrap();
        assert!(conn.ping());
        pool.release(conn);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_unblocks_waiters() {
        let factory = MockFactory::new();
        let cfg = PoolConfig {
            connection_timeout: Duration::from_secs(5),
            ..config(1, 1)
        };
        let pool = ConnectionPool::initialize("stop", cfg, factory).unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let started = Instant::now();
                (pool.acquire().map(|_| ()), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        pool.shutdown();

        let (result, waited) = waiter.join().unwrap();
        assert!(matches!(result, Err(DbError::ShuttingDown)));
        assert!(waited < Duration::from_secs(2));

        pool.release(held);
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.idle, 0);
        assert!(pool.is_shut_down());
        assert!(matches!(pool.acquire(), Err(DbError::ShuttingDown)));
    }

    #[test]
    fn test_background_threads_run_and_stop() {
        let factory = MockFactory::new();
        let cfg = PoolConfig {
            idle_timeout: Duration::ZERO,
            cleanup_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_millis(20),
            ..config(1, 4)
        };
        let pool = ConnectionPool::initialize("bg", cfg, factory).unwrap();
        assert!(pool.set_pool_size(4));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.total_connections() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.total_connections(), 1);

        let started = Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_many_threads_keep_invariants() {
        const THREADS: usize = 100;
        const ITERATIONS: usize = 1000;

        let factory = MockFactory::new();
        let cfg = PoolConfig {
            connection_timeout: Duration::from_secs(10),
            ..config(2, 10)
        };
        let pool = ConnectionPool::initialize("stress", cfg, factory).unwrap();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<usize>();

        for _ in 0..THREADS {
            let pool = Arc::clone(&pool);
            let done = done_tx.clone();
            thread::spawn(move || {
                let mut failures = 0;
                for _ in 0..ITERATIONS {
                    match pool.acquire() {
                        Ok(conn) => pool.release(conn),
                        Err(_) => failures += 1,
                    }
                }
                let _ = done.send(failures);
            });
        }
        drop(done_tx);

        let mut failures = 0;
        for _ in 0..THREADS {
            failures += done_rx
                .recv_timeout(Duration::from_secs(120))
                .expect("pool stress test deadlocked");
        }
        assert_eq!(failures, 0);

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, stats.idle);
        assert!(stats.total <= 10);
        assert_consistent(&pool);
        pool.shutdown();
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let (pool, _) = pool(2, 6);
        let mut held: Vec<Connection> = Vec::new();
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for _ in 0..2000 {
            match next() % 5 {
                0 | 1 if held.len() < 6 => {
                    let conn = pool.acquire().unwrap();
                    assert!(!held.iter().any(|c| c.id() == conn.id()));
                    held.push(conn);
                }
                2 if !held.is_empty() => {
                    let i = next() % held.len();
                    pool.release(held.swap_remove(i));
                }
                3 => {
                    let size = 2 + next() % 5;
                    assert!(pool.set_pool_size(size));
                }
                4 => {
                    pool.cleanup_idle();
                }
                _ => {}
            }
            assert_consistent(&pool);
            assert_eq!(pool.active_connections(), held.len());
        }

        for conn in held.drain(..) {
            pool.release(conn);
        }
        assert_consistent(&pool);
        pool.shutdown();
    }
}
