//! Processed-message store.
//!
//! Broker delivery is at-least-once; recording `{queue}:{message_id}` once a
//! job's side effects are durable lets every later redelivery be skipped.
//! Entries expire after a TTL (24h by default).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use jobline_core::{Clock, MessageId, QueueResult};

pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Dedup key for a message on a queue.
pub fn idempotency_key(queue: &str, message_id: &MessageId) -> String {
    format!("{queue}:{message_id}")
}

pub trait IdempotencyStore: Send + Sync {
    fn is_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<bool>;

    fn mark_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<()>;
}

impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    fn is_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<bool> {
        (**self).is_processed(message_id, queue)
    }

    fn mark_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<()> {
        (**self).mark_processed(message_id, queue)
    }
}

/// In-memory store for tests/dev. Expiry follows the injected clock.
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    entries: RwLock<HashMap<String, i64>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.unix_now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn is_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<bool> {
        let key = idempotency_key(queue, message_id);
        let entries = self.entries.read().unwrap();
        Ok(entries
            .get(&key)
            .is_some_and(|expires_at| *expires_at > self.clock.unix_now()))
    }

    fn mark_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<()> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = self.clock.unix_now().saturating_add(ttl);
        let mut entries = self.entries.write().unwrap();
        entries.insert(idempotency_key(queue, message_id), expires_at);
        Ok(())
    }
}

/// Redis-backed store (`SET key 1 NX EX ttl`).
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct RedisIdempotencyStore {
    client: Arc<redis::Client>,
    key_prefix: String,
    ttl: Duration,
}

#[cfg(feature = "redis")]
impl RedisIdempotencyStore {
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
        ttl: Duration,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.unwrap_or_else(|| "jobline:processed".to_string()),
            ttl,
        })
    }

    fn key(&self, queue: &str, message_id: &MessageId) -> String {
        format!("{}:{}", self.key_prefix, idempotency_key(queue, message_id))
    }
}

#[cfg(feature = "redis")]
impl IdempotencyStore for RedisIdempotencyStore {
    fn is_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<bool> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        redis::cmd("EXISTS")
            .arg(self.key(queue, message_id))
            .query::<bool>(&mut conn)
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))
    }

    fn mark_processed(&self, message_id: &MessageId, queue: &str) -> QueueResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        // NX: the first writer's timestamp wins; a nil reply is not an error.
        redis::cmd("SET")
            .arg(self.key(queue, message_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query::<Option<String>>(&mut conn)
            .map_err(|e| jobline_core::QueueError::store(e.to_string()))?;
        Ok(())
    }
}
