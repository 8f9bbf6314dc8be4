//! Partition assignment across consumer instances.
//!
//! Every live instance registers itself (with a heartbeat) in a shared
//! [`ConsumerRegistry`]. Assignment is computed locally and
//! deterministically from the sorted set of live consumer ids:
//! partition `p` belongs to the consumer at index `p % n`. Instances that see
//! the same registry therefore agree on a disjoint, complete split without
//! talking to each other.
//!
//! Rebalancing is time-gated: [`PartitionManager::need_rebalance`] only says
//! yes once per `rebalance_interval`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use jobline_core::{Clock, ConsumerIdentity, QueueResult};

/// Shared set of consumer heartbeats, per topic.
pub trait ConsumerRegistry: Send + Sync {
    /// Register `consumer` or refresh its heartbeat to `at` (unix seconds).
    fn heartbeat(&self, topic: &str, consumer: &str, at: i64) -> QueueResult<()>;

    fn remove(&self, topic: &str, consumer: &str) -> QueueResult<()>;

    /// Consumers whose last heartbeat is at or after `since`.
    fn active(&self, topic: &str, since: i64) -> QueueResult<Vec<String>>;
}

/// In-memory registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryConsumerRegistry {
    topics: RwLock<HashMap<String, HashMap<String, i64>>>,
}

impl InMemoryConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumerRegistry for InMemoryConsumerRegistry {
    fn heartbeat(&self, topic: &str, consumer: &str, at: i64) -> QueueResult<()> {
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(consumer.to_string(), at);
        Ok(())
    }

    fn remove(&self, topic: &str, consumer: &str) -> QueueResult<()> {
        let mut topics = self.topics.write().unwrap();
        if let Some(consumers) = topics.get_mut(topic) {
            consumers.remove(consumer);
        }
        Ok(())
    }

    fn active(&self, topic: &str, since: i64) -> QueueResult<Vec<String>> {
        let topics = self.topics.read().unwrap();
        Ok(topics
            .get(topic)
            .map(|consumers| {
                consumers
                    .iter()
                    .filter(|(_, at)| **at >= since)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl<R: ConsumerRegistry + ?Sized> ConsumerRegistry for Arc<R> {
    fn heartbeat(&self, topic: &str, consumer: &str, at: i64) -> QueueResult<()> {
        (**self).heartbeat(topic, consumer, at)
    }

    fn remove(&self, topic: &str, consumer: &str) -> QueueResult<()> {
        (**self).remove(topic, consumer)
    }

    fn active(&self, topic: &str, since: i64) -> QueueResult<Vec<String>> {
        (**self).active(topic, since)
    }
}

/// Redis-backed registry: one sorted set per topic, scored by heartbeat.
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct RedisConsumerRegistry {
    client: Arc<redis::Client>,
    key_prefix: String,
}

#[cfg(feature = "redis")]
impl RedisConsumerRegistry {
    pub fn new(redis_url: impl AsRef<str>, key_prefix: Option<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.unwrap_or_else(|| "jobline:consumers".to_string()),
        })
    }

    fn key(&self, topic: &str) -> String {
        format!("{}:{}", self.key_prefix, topic)
    }

    fn connection(&self) -> QueueResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))
    }
}

#[cfg(feature = "redis")]
impl ConsumerRegistry for RedisConsumerRegistry {
    fn heartbeat(&self, topic: &str, consumer: &str, at: i64) -> QueueResult<()> {
        let mut conn = self.connection()?;
        redis::cmd("ZADD")
            .arg(self.key(topic))
            .arg(at)
            .arg(consumer)
            .query::<i64>(&mut conn)
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, topic: &str, consumer: &str) -> QueueResult<()> {
        let mut conn = self.connection()?;
        redis::cmd("ZREM")
            .arg(self.key(topic))
            .arg(consumer)
            .query::<i64>(&mut conn)
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        Ok(())
    }

    fn active(&self, topic: &str, since: i64) -> QueueResult<Vec<String>> {
        let mut conn = self.connection()?;
        redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(topic))
            .arg(since)
            .arg("+inf")
            .query::<Vec<String>>(&mut conn)
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))
    }
}

/// Partitions of a `partitions`-partition topic owned by `consumer`, given
/// the full set of live `consumers`. Empty if `consumer` is not live.
pub fn assign_partitions(consumers: &[String], consumer: &str, partitions: i32) -> Vec<i32> {
    let mut sorted: Vec<&str> = consumers.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let Some(index) = sorted.iter().position(|c| *c == consumer) else {
        return Vec::new();
    };
    let n = sorted.len() as i32;
    (0..partitions).filter(|p| p % n == index as i32).collect()
}

/// Computes this instance's share of each topic.
#[derive(Clone)]
pub struct PartitionManager {
    registry: Arc<dyn ConsumerRegistry>,
    clock: Arc<dyn Clock>,
    rebalance_interval: Duration,
    consumer_ttl: Duration,
}

impl PartitionManager {
    pub fn new(
        registry: Arc<dyn ConsumerRegistry>,
        clock: Arc<dyn Clock>,
        rebalance_interval: Duration,
        consumer_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            rebalance_interval,
            consumer_ttl,
        }
    }

    pub fn rebalance_interval(&self) -> Duration {
        self.rebalance_interval
    }

    /// Register `consumer` for `topic`, or refresh its heartbeat.
    pub fn register_consumer(&self, topic: &str, consumer: &ConsumerIdentity) -> QueueResult<()> {
        self.registry
            .heartbeat(topic, &consumer.key(), self.clock.unix_now())
    }

    /// Drop `consumer` from `topic`; survivors absorb its partitions at their
    /// next rebalance.
    pub fn unregister_consumer(&self, topic: &str, consumer: &ConsumerIdentity) -> QueueResult<()> {
        info!(topic, consumer = %consumer, "consumer unregistered");
        self.registry.remove(topic, &consumer.key())
    }

    /// Live consumers of `topic`, sorted.
    pub fn active_consumers(&self, topic: &str) -> QueueResult<Vec<String>> {
        let ttl = i64::try_from(self.consumer_ttl.as_secs()).unwrap_or(i64::MAX);
        let since = self.clock.unix_now().saturating_sub(ttl);
        let mut consumers = self.registry.active(topic, since)?;
        consumers.sort();
        Ok(consumers)
    }

    /// Partitions of `topic` owned by `consumer`.
    pub fn get_consumer_partitions(
        &self,
        topic: &str,
        consumer: &ConsumerIdentity,
        partition_count: i32,
    ) -> QueueResult<Vec<i32>> {
        let consumers = self.active_consumers(topic)?;
        let assigned = assign_partitions(&consumers, &consumer.key(), partition_count);
        debug!(
            topic,
            consumer = %consumer,
            live = consumers.len(),
            partitions = ?assigned,
            "partitions computed"
        );
        Ok(assigned)
    }

    /// True once `rebalance_interval` has elapsed since `last_check`.
    pub fn need_rebalance(&self, topic: &str, last_check: DateTime<Utc>) -> bool {
        let elapsed = self.clock.now().signed_duration_since(last_check);
        let due = elapsed
            .to_std()
            .map(|e| e >= self.rebalance_interval)
            .unwrap_or(false);
        if due {
            debug!(topic, "rebalance due");
        }
        due
    }
}

impl core::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("rebalance_interval", &self.rebalance_interval)
            .field("consumer_ttl", &self.consumer_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::ManualClock;
    use uuid::Uuid;

    fn manager(clock: Arc<ManualClock>) -> PartitionManager {
        PartitionManager::new(
            Arc::new(InMemoryConsumerRegistry::new()),
            clock,
            Duration::from_secs(30),
            Duration::from_secs(90),
        )
    }

    fn consumer(host: &str) -> ConsumerIdentity {
        ConsumerIdentity::new(host, 1, Uuid::new_v4())
    }

    #[test]
    fn two_consumers_split_four_partitions() {
        let clock = Arc::new(ManualClock::starting_now());
        let pm = manager(clock);
        let a = consumer("a");
        let b = consumer("b");
        pm.register_consumer("orders", &a).unwrap();
        pm.register_consumer("orders", &b).unwrap();

        let pa = pm.get_consumer_partitions("orders", &a, 4).unwrap();
        let pb = pm.get_consumer_partitions("orders", &b, 4).unwrap();
        assert_eq!(pa.len(), 2);
        assert_eq!(pb.len(), 2);

        let mut all: Vec<_> = pa.iter().chain(pb.iter()).copied().collect();
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3]);

        pm.unregister_consumer("orders", &b).unwrap();
        assert_eq!(pm.get_consumer_partitions("orders", &a, 4).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn stale_consumers_are_ignored() {
        let clock = Arc::new(ManualClock::starting_now());
        let pm = manager(clock.clone());
        let a = consumer("a");
        let b = consumer("b");
        pm.register_consumer("t", &a).unwrap();
        pm.register_consumer("t", &b).unwrap();

        clock.advance(Duration::from_secs(120));
        pm.register_consumer("t", &a).unwrap();

        assert_eq!(pm.active_consumers("t").unwrap(), vec![a.key()]);
        assert_eq!(pm.get_consumer_partitions("t", &a, 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unregistered_consumer_owns_nothing() {
        let clock = Arc::new(ManualClock::starting_now());
        let pm = manager(clock);
        assert!(pm.get_consumer_partitions("t", &consumer("x"), 3).unwrap().is_empty());
    }

    #[test]
    fn rebalance_is_time_gated() {
        let clock = Arc::new(ManualClock::starting_now());
        let pm = manager(clock.clone());
        let last = clock.now();

        assert!(!pm.need_rebalance("t", last));
        clock.advance(Duration::from_secs(29));
        assert!(!pm.need_rebalance("t", last));
        clock.advance(Duration::from_secs(1));
        assert!(pm.need_rebalance("t", last));
    }

    #[test]
    fn more_consumers_than_partitions() {
        let consumers: Vec<String> = (0..5).map(|i| format!("c{i}")).collect();
        let owned: Vec<usize> = consumers
            .iter()
            .map(|c| assign_partitions(&consumers, c, 2).len())
            .collect();
        assert_eq!(owned, vec![1, 1, 0, 0, 0]);
    }
}
