//! Dead-letter queue: durable side-store for messages that exhausted their
//! retry budget.
//!
//! Records are appended to one ordered list per queue. They leave the list
//! only through `retry` (republished by the caller's callback) or `clear`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use jobline_core::{Clock, QueueError, QueueResult};

/// One dead-lettered message (stored as JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub queue: String,
    pub payload: Value,
    pub error: String,
    pub failed_at: i64,
    pub retry_count: u32,
}

/// Ordered string lists keyed by name.
pub trait ListStore: Send + Sync {
    /// Append to the tail.
    fn push(&self, key: &str, value: String) -> QueueResult<()>;

    /// Inclusive range; negative indexes count from the tail (`-1` = last).
    fn range(&self, key: &str, start: isize, end: isize) -> QueueResult<Vec<String>>;

    fn len(&self, key: &str) -> QueueResult<usize>;

    /// Remove and return the element at `index`.
    fn remove_at(&self, key: &str, index: usize) -> QueueResult<Option<String>>;

    /// Drop the whole list; returns how many elements it held.
    fn delete(&self, key: &str) -> QueueResult<usize>;
}

fn resolve_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}

/// In-memory list store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryListStore {
    lists: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ListStore for InMemoryListStore {
    fn push(&self, key: &str, value: String) -> QueueResult<()> {
        let mut lists = self.lists.write().unwrap();
        lists.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    fn range(&self, key: &str, start: isize, end: isize) -> QueueResult<Vec<String>> {
        let lists = self.lists.read().unwrap();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(resolve_range(list.len(), start, end)
            .map(|(s, e)| list[s..=e].to_vec())
            .unwrap_or_default())
    }

    fn len(&self, key: &str) -> QueueResult<usize> {
        let lists = self.lists.read().unwrap();
        Ok(lists.get(key).map_or(0, Vec::len))
    }

    fn remove_at(&self, key: &str, index: usize) -> QueueResult<Option<String>> {
        let mut lists = self.lists.write().unwrap();
        Ok(lists
            .get_mut(key)
            .filter(|list| index < list.len())
            .map(|list| list.remove(index)))
    }

    fn delete(&self, key: &str) -> QueueResult<usize> {
        let mut lists = self.lists.write().unwrap();
        Ok(lists.remove(key).map_or(0, |l| l.len()))
    }
}

/// Redis lists (`RPUSH` / `LRANGE` / `LLEN` / `LSET`+`LREM` / `DEL`).
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct RedisListStore {
    client: Arc<redis::Client>,
}

#[cfg(feature = "redis")]
impl RedisListStore {
    /// Placeholder written over an element before `LREM` removes it.
    const TOMBSTONE: &'static str = "__jobline_removed__";

    pub fn new(redis_url: impl AsRef<str>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::store(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> QueueResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::store(e.to_string()))
    }
}

#[cfg(feature = "redis")]
impl ListStore for RedisListStore {
    fn push(&self, key: &str, value: String) -> QueueResult<()> {
        let mut conn = self.connection()?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query::<i64>(&mut conn)
            .map_err(|e| QueueError::store(e.to_string()))?;
        Ok(())
    }

    fn range(&self, key: &str, start: isize, end: isize) -> QueueResult<Vec<String>> {
        let mut conn = self.connection()?;
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .query(&mut conn)
            .map_err(|e| QueueError::store(e.to_string()))
    }

    fn len(&self, key: &str) -> QueueResult<usize> {
        let mut conn = self.connection()?;
        redis::cmd("LLEN")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| QueueError::store(e.to_string()))
    }

    fn remove_at(&self, key: &str, index: usize) -> QueueResult<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("LINDEX")
            .arg(key)
            .arg(index)
            .query(&mut conn)
            .map_err(|e| QueueError::store(e.to_string()))?;
        if value.is_none() {
            return Ok(None);
        }
        redis::pipe()
            .atomic()
            .cmd("LSET")
            .arg(key)
            .arg(index)
            .arg(Self::TOMBSTONE)
            .ignore()
            .cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(Self::TOMBSTONE)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| QueueError::store(e.to_string()))?;
        Ok(value)
    }

    fn delete(&self, key: &str) -> QueueResult<usize> {
        let len = self.len(key)?;
        let mut conn = self.connection()?;
        redis::cmd("DEL")
            .arg(key)
            .query::<i64>(&mut conn)
            .map_err(|e| QueueError::store(e.to_string()))?;
        Ok(len)
    }
}

/// Outcome of a bulk retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub retried: usize,
    pub failed: usize,
}

/// Records grouped by error string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBucket {
    pub error: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    pub total_messages: usize,
    /// Most frequent first.
    pub errors: Vec<ErrorBucket>,
}

pub struct DeadLetterQueue {
    store: Arc<dyn ListStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn ListStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            key_prefix: "jobline:dead_letter".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, queue: &str) -> String {
        format!("{}:{}", self.key_prefix, queue)
    }

    /// Append a record. `attempts` is the number of failed deliveries so far;
    /// when the message was dead-lettered before, the new record's
    /// `retry_count` continues from the previous one.
    pub fn add(
        &self,
        message_id: &str,
        queue: &str,
        payload: Value,
        error: &str,
        attempts: u32,
    ) -> QueueResult<DeadLetterRecord> {
        let prior = self
            .get_messages(queue, 0, -1)?
            .into_iter()
            .filter(|r| r.message_id == message_id)
            .map(|r| r.retry_count)
            .max();

        let retry_count = match prior {
            Some(prev) => attempts.max(prev + 1),
            None => attempts,
        };

        let record = DeadLetterRecord {
            message_id: message_id.to_string(),
            queue: queue.to_string(),
            payload,
            error: error.to_string(),
            failed_at: self.clock.unix_now(),
            retry_count,
        };
        self.store
            .push(&self.key(queue), serde_json::to_string(&record)?)?;

        warn!(queue, message_id, retry_count, error, "message dead-lettered");
        Ok(record)
    }

    /// Records `start..=end` (negative indexes count from the end).
    pub fn get_messages(
        &self,
        queue: &str,
        start: isize,
        end: isize,
    ) -> QueueResult<Vec<DeadLetterRecord>> {
        let raw = self.store.range(&self.key(queue), start, end)?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(queue, error = %e, "skipping undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    pub fn count(&self, queue: &str) -> QueueResult<usize> {
        self.store.len(&self.key(queue))
    }

    /// Hand the record at `index` to `republish`; on success it is removed.
    pub fn retry<F>(&self, queue: &str, index: usize, republish: F) -> QueueResult<DeadLetterRecord>
    where
        F: FnOnce(&DeadLetterRecord) -> QueueResult<()>,
    {
        let idx = isize::try_from(index)
            .map_err(|_| QueueError::NotFound(format!("{queue}[{index}]")))?;
        let record = self
            .get_messages(queue, idx, idx)?
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::NotFound(format!("dead letter {queue}[{index}]")))?;

        republish(&record)?;
        self.store.remove_at(&self.key(queue), index)?;
        info!(queue, message_id = %record.message_id, "dead letter retried");
        Ok(record)
    }

    /// Retry every record, oldest first. Records whose callback fails stay,
    /// as do entries that no longer decode.
    pub fn retry_all<F>(&self, queue: &str, mut republish: F) -> QueueResult<RetrySummary>
    where
        F: FnMut(&DeadLetterRecord) -> QueueResult<()>,
    {
        let raw = self.store.range(&self.key(queue), 0, -1)?;
        let mut summary = RetrySummary::default();
        let mut done = Vec::new();

        for (index, entry) in raw.iter().enumerate() {
            let record: DeadLetterRecord = match serde_json::from_str(entry) {
                Ok(record) => record,
                Err(e) => {
                    warn!(queue, index, error = %e, "skipping undecodable dead-letter entry");
                    continue;
                }
            };
            match republish(&record) {
                Ok(()) => {
                    summary.retried += 1;
                    done.push(index);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        queue,
                        message_id = %record.message_id,
                        error = %e,
                        "dead letter retry failed"
                    );
                }
            }
        }

        // Highest index first so earlier indexes stay valid.
        for index in done.into_iter().rev() {
            self.store.remove_at(&self.key(queue), index)?;
        }
        Ok(summary)
    }

    /// Delete every record of `queue`.
    pub fn clear(&self, queue: &str) -> QueueResult<usize> {
        let removed = self.store.delete(&self.key(queue))?;
        info!(queue, removed, "dead letters cleared");
        Ok(removed)
    }

    pub fn analyze_errors(&self, queue: &str) -> QueueResult<ErrorAnalysis> {
        let records = self.get_messages(queue, 0, -1)?;
        let total = records.len();

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            *counts.entry(record.error.clone()).or_default() += 1;
        }

        let mut errors: Vec<ErrorBucket> = counts
            .into_iter()
            .map(|(error, count)| ErrorBucket {
                error,
                count,
                percentage: if total == 0 {
                    0.0
                } else {
                    (count as f64 / total as f64 * 10_000.0).round() / 100.0
                },
            })
            .collect();
        errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));

        Ok(ErrorAnalysis {
            total_messages: total,
            errors,
        })
    }
}

impl core::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
