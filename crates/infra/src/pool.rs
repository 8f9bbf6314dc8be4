//! Bounded pool of producer connections.
//!
//! - `get` hands out an idle connection, creates one while below
//!   `max_connections`, or blocks until one is returned (bounded wait)
//! - dropping the [`PooledConnection`] guard recycles it: buffered records
//!   are flushed first, and a connection that fails to flush is still
//!   returned to the pool (logged)
//! - every `check_interval`, connections idle longer than `max_idle_time`
//!   are destroyed while more than `min_connections` exist
//!
//! Pools are looked up by name through a [`PoolRegistry`] owned by the
//! connector context.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jobline_core::{QueueError, QueueResult};
use jobline_observability::MetricsSink;

use crate::broker::{Broker, Producer, ProducerSettings};

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub max_idle_time_secs: u64,
    /// Upper bound on any borrow wait.
    pub max_wait_time_secs: u64,
    /// Default borrow wait used by `get`.
    pub get_timeout_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            max_idle_time_secs: 60,
            max_wait_time_secs: 3,
            get_timeout_secs: 3,
            check_interval_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_secs)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.get_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_connections == 0 {
            return Err(QueueError::config("pool.max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(QueueError::config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Creates and maintains the connections held by a pool.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send;

    /// Build connection number `seq` (0-based, unique per pool).
    fn create(&self, seq: u64) -> QueueResult<Self::Connection>;

    /// Prepare a returned connection for the next borrower.
    fn recycle(&self, conn: &mut Self::Connection) -> QueueResult<()>;

    /// Tear a connection down for good.
    fn destroy(&self, mut conn: Self::Connection) -> QueueResult<()> {
        self.recycle(&mut conn)
    }
}

/// Connection counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub created: usize,
    pub idle: usize,
    pub using: usize,
    pub max: usize,
}

struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    created: usize,
    using: usize,
    next_seq: u64,
    last_check: Instant,
    closed: bool,
}

impl<C> PoolState<C> {
    /// Remove idle connections past `max_idle` while above `min`.
    fn take_expired(&mut self, now: Instant, config: &PoolConfig, force: bool) -> Vec<C> {
        if !force && now.duration_since(self.last_check) < config.check_interval() {
            return Vec::new();
        }
        self.last_check = now;

        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        while let Some(entry) = self.idle.pop_front() {
            let stale = now.duration_since(entry.since) >= config.max_idle_time();
            if stale && self.created > config.min_connections {
                self.created -= 1;
                expired.push(entry.conn);
            } else {
                kept.push_back(entry);
            }
        }
        self.idle = kept;
        expired
    }
}

pub struct ConnectionPool<F: ConnectionFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    returned: Condvar,
    metrics: Arc<dyn MetricsSink>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Build the pool and open `min_connections` connections up front.
    pub fn new(
        name: impl Into<String>,
        factory: F,
        config: PoolConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let name = name.into();

        let mut idle = VecDeque::with_capacity(config.max_connections);
        for seq in 0..config.min_connections as u64 {
            idle.push_back(IdleConnection {
                conn: factory.create(seq)?,
                since: Instant::now(),
            });
        }

        let pool = Self {
            state: Mutex::new(PoolState {
                created: idle.len(),
                next_seq: idle.len() as u64,
                idle,
                using: 0,
                last_check: Instant::now(),
                closed: false,
            }),
            name,
            factory,
            config,
            returned: Condvar::new(),
            metrics,
        };
        pool.publish_status();
        info!(
            pool = %pool.name,
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            "connection pool created"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a connection, waiting up to `get_timeout`.
    pub fn get(&self) -> QueueResult<PooledConnection<'_, F>> {
        self.get_timeout(self.config.get_timeout())
    }

    /// Borrow a connection, waiting up to `timeout` (capped at
    /// `max_wait_time`).
    pub fn get_timeout(&self, timeout: Duration) -> QueueResult<PooledConnection<'_, F>> {
        let timeout = timeout.min(self.config.max_wait_time());
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(QueueError::Pool(format!("pool {} is closed", self.name)));
            }

            let expired = state.take_expired(Instant::now(), &self.config, false);
            if !expired.is_empty() {
                drop(state);
                self.destroy_all(expired);
                state = self.state.lock().unwrap();
                continue;
            }

            if let Some(entry) = state.idle.pop_front() {
                state.using += 1;
                drop(state);
                self.publish_status();
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(entry.conn),
                });
            }

            if state.created < self.config.max_connections {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.created += 1;
                state.using += 1;
                drop(state);

                return match self.factory.create(seq) {
                    Ok(conn) => {
                        debug!(pool = %self.name, seq, "connection created");
                        self.publish_status();
                        Ok(PooledConnection {
                            pool: self,
                            conn: Some(conn),
                        })
                    }
                    Err(err) => {
                        let mut state = self.state.lock().unwrap();
                        state.created -= 1;
                        state.using -= 1;
                        drop(state);
                        self.returned.notify_one();
                        Err(err)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::timeout(format!(
                    "no connection available in pool {} after {:?}",
                    self.name, timeout
                )));
            }
            let (guard, _) = self.returned.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap();
        PoolStatus {
            created: state.created,
            idle: state.idle.len(),
            using: state.using,
            max: self.config.max_connections,
        }
    }

    /// Run the idle check now, regardless of `check_interval`.
    pub fn reap_idle(&self) -> usize {
        let expired = {
            let mut state = self.state.lock().unwrap();
            state.take_expired(Instant::now(), &self.config, true)
        };
        let n = expired.len();
        self.destroy_all(expired);
        n
    }

    /// Flush and destroy every idle connection and refuse further borrows.
    /// Borrowed connections are destroyed when they come back.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).map(|e| e.conn).collect();
            state.created -= drained.len();
            drained
        };
        self.returned.notify_all();
        let n = drained.len();
        self.destroy_all(drained);
        info!(pool = %self.name, closed = n, "connection pool closed");
    }

    fn destroy_all(&self, conns: Vec<F::Connection>) {
        for conn in conns {
            if let Err(e) = self.factory.destroy(conn) {
                warn!(pool = %self.name, error = %e, "failed to destroy connection cleanly");
            }
        }
        self.publish_status();
    }

    fn put_back(&self, mut conn: F::Connection) {
        if let Err(e) = self.factory.recycle(&mut conn) {
            warn!(pool = %self.name, error = %e, "connection failed to flush on recycle");
        }

        let mut state = self.state.lock().unwrap();
        state.using = state.using.saturating_sub(1);
        if state.closed {
            state.created = state.created.saturating_sub(1);
            drop(state);
            self.destroy_all(vec![conn]);
            return;
        }
        state.idle.push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
        drop(state);
        self.returned.notify_one();
        self.publish_status();
    }

    fn discard(&self, conn: F::Connection) {
        {
            let mut state = self.state.lock().unwrap();
            state.using = state.using.saturating_sub(1);
            state.created = state.created.saturating_sub(1);
        }
        self.returned.notify_one();
        self.destroy_all(vec![conn]);
    }

    fn publish_status(&self) {
        let status = self.status();
        self.metrics
            .set_pool_connections(&self.name, "created", status.created as i64);
        self.metrics
            .set_pool_connections(&self.name, "idle", status.idle as i64);
        self.metrics
            .set_pool_connections(&self.name, "using", status.using as i64);
    }
}

impl<F: ConnectionFactory> core::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Exclusive borrow of a pooled connection; recycled on drop.
pub struct PooledConnection<'p, F: ConnectionFactory> {
    pool: &'p ConnectionPool<F>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<'_, F> {
    /// Destroy the connection instead of returning it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<'_, F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `None` after `discard`/drop, which consume the guard.
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

/// Builds producers for a pool.
///
/// With a transactional id, each connection gets its own id
/// (`{id}-{seq}`); two live producers must never share one.
pub struct ProducerFactory {
    broker: Arc<dyn Broker>,
    settings: ProducerSettings,
    flush_timeout: Duration,
}

impl ProducerFactory {
    pub fn new(
        broker: Arc<dyn Broker>,
        settings: ProducerSettings,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            settings,
            flush_timeout,
        }
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }
}

impl ConnectionFactory for ProducerFactory {
    type Connection = Box<dyn Producer>;

    fn create(&self, seq: u64) -> QueueResult<Self::Connection> {
        let mut settings = self.settings.clone();
        if let Some(id) = &settings.transactional_id {
            settings.transactional_id = Some(format!("{id}-{seq}"));
        }
        self.broker.create_producer(&settings)
    }

    fn recycle(&self, conn: &mut Self::Connection) -> QueueResult<()> {
        if conn.in_flight() == 0 {
            return Ok(());
        }
        conn.flush(self.flush_timeout)
    }
}

pub type ProducerPool = ConnectionPool<ProducerFactory>;

/// Named pools (one per logical sink, e.g. `"kafka"`).
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Arc<ProducerPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pool: ProducerPool) -> Arc<ProducerPool> {
        let pool = Arc::new(pool);
        self.pools
            .lock()
            .unwrap()
            .insert(pool.name().to_string(), pool.clone());
        pool
    }

    pub fn get_pool(&self, name: &str) -> Option<Arc<ProducerPool>> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    /// Return the named pool, building it with `build` on first use.
    pub fn get_or_create(
        &self,
        name: &str,
        build: impl FnOnce() -> QueueResult<ProducerPool>,
    ) -> QueueResult<Arc<ProducerPool>> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(build()?);
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    pub fn all_status(&self) -> BTreeMap<String, PoolStatus> {
        let pools = self.pools.lock().unwrap();
        pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.status()))
            .collect()
    }

    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.lock().unwrap().values().cloned().collect();
        for pool in pools {
            pool.close_all();
        }
    }
}

impl core::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.all_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use jobline_observability::{MetricsCollector, NoopMetrics};

    use crate::broker::InMemoryBroker;

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        recycled: AtomicUsize,
        destroyed: AtomicUsize,
        fail_recycle: bool,
    }

    impl ConnectionFactory for Arc<CountingFactory> {
        type Connection = u64;

        fn create(&self, seq: u64) -> QueueResult<u64> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(seq)
        }

        fn recycle(&self, _conn: &mut u64) -> QueueResult<()> {
            self.recycled.fetch_add(1, Ordering::SeqCst);
            if self.fail_recycle {
                return Err(QueueError::timeout("flush"));
            }
            Ok(())
        }

        fn destroy(&self, _conn: u64) -> QueueResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            max_connections: max,
            max_wait_time_secs: 1,
            get_timeout_secs: 1,
            ..Default::default()
        }
    }

    fn pool(
        factory: Arc<CountingFactory>,
        config: PoolConfig,
    ) -> ConnectionPool<Arc<CountingFactory>> {
        ConnectionPool::new("test", factory, config, Arc::new(NoopMetrics)).unwrap()
    }

    #[test]
    fn min_connections_are_opened_up_front() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(factory.clone(), config(2, 4));

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(
            pool.status(),
            PoolStatus {
                created: 2,
                idle: 2,
                using: 0,
                max: 4
            }
        );
    }

    #[test]
    fn borrowed_connection_is_recycled_on_drop() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(factory.clone(), config(1, 2));

        {
            let conn = pool.get().unwrap();
            assert_eq!(*conn, 0);
            assert_eq!(pool.status().using, 1);
        }

        assert_eq!(factory.recycled.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().using, 0);
    }

    #[test]
    fn failed_flush_still_returns_connection() {
        let factory = Arc::new(CountingFactory {
            fail_recycle: true,
            ..Default::default()
        });
        let pool = pool(factory, config(1, 1));

        drop(pool.get().unwrap());
        assert_eq!(pool.status().idle, 1);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn exhausted_pool_times_out() {
        let factory = Arc::new(CountingFactory::default());
        let mut cfg = config(0, 1);
        cfg.max_wait_time_secs = 0;
        let pool = pool(factory, cfg);

        let _held = pool.get().unwrap();
        let err = pool.get().err().unwrap();
        assert!(matches!(err, QueueError::Timeout(_)));
    }

    #[test]
    fn waiter_gets_connection_when_returned() {
        let factory = Arc::new(CountingFactory::default());
        let pool = Arc::new(pool(factory.clone(), config(0, 1)));

        let held = pool.get().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get().map(|c| *c))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_connections_above_min_are_reaped() {
        let factory = Arc::new(CountingFactory::default());
        let mut cfg = config(1, 3);
        cfg.max_idle_time_secs = 0;
        let pool = pool(factory.clone(), cfg);

        {
            let _a = pool.get().unwrap();
            let _b = pool.get().unwrap();
            let _c = pool.get().unwrap();
        }
        assert_eq!(pool.status().created, 3);

        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.status().created, 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_all_rejects_new_borrows() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(factory.clone(), config(2, 2));

        let held = pool.get().unwrap();
        pool.close_all();
        assert!(matches!(pool.get(), Err(QueueError::Pool(_))));

        drop(held);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().created, 0);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        let factory = Arc::new(CountingFactory::default());
        let err = ConnectionPool::new("bad", factory, config(3, 2), Arc::new(NoopMetrics)).err();
        assert!(matches!(err, Some(QueueError::ConfigInvalid(_))));
    }

    #[test]
    fn producer_factory_suffixes_transactional_ids() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1, 1).unwrap();
        let factory = ProducerFactory::new(
            Arc::new(broker.clone()),
            ProducerSettings {
                transactional_id: Some("jobline".into()),
                ..Default::default()
            },
            Duration::from_secs(1),
        );
        assert_eq!(factory.settings().transactional_id.as_deref(), Some("jobline"));

        let mut conn = factory.create(3).unwrap();
        assert!(conn.is_transactional());
        conn.send("t", None, b"x").unwrap();
        factory.recycle(&mut conn).unwrap();
        assert_eq!(broker.topic_len("t"), 1);
    }

    #[test]
    fn registry_reports_every_pool() {
        let metrics = Arc::new(MetricsCollector::new());
        let registry = PoolRegistry::new();
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());

        let pool = registry
            .get_or_create("kafka", || {
                ConnectionPool::new(
                    "kafka",
                    ProducerFactory::new(
                        broker.clone(),
                        ProducerSettings::default(),
                        Duration::from_secs(1),
                    ),
                    PoolConfig::default(),
                    metrics.clone(),
                )
            })
            .unwrap();
        let again = registry.get_or_create("kafka", || unreachable!()).unwrap();
        assert!(Arc::ptr_eq(&pool, &again));

        let status = registry.all_status();
        assert_eq!(status["kafka"].created, 1);
        assert_eq!(status["kafka"].max, 10);
        assert!(metrics.render().contains("jobline_pool_connections"));

        registry.close_all();
        assert!(registry.get_pool("kafka").unwrap().get().is_err());
    }
}
