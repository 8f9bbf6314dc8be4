//! In-memory broker for tests/dev.
//!
//! Topics are vectors of append-only partition logs; committed offsets are
//! tracked per consumer group exactly like a real broker, so an
//! unacknowledged record is redelivered after a reassignment.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use jobline_core::{QueueError, QueueResult};

use super::{
    Broker, BrokerRecord, Consumer, ConsumerSettings, PollOutcome, Producer, ProducerSettings,
    TopicPartition,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingRecord {
    topic: String,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, TopicPartition), i64>,
    next_partition: HashMap<String, usize>,
}

impl BrokerState {
    fn ensure_topic(&mut self, topic: &str, partitions: i32) {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    fn append(&mut self, record: PendingRecord, auto_create: Option<i32>) -> QueueResult<()> {
        if !self.topics.contains_key(&record.topic) {
            match auto_create {
                Some(partitions) => self.ensure_topic(&record.topic, partitions),
                None => return Err(QueueError::UnknownTopic(record.topic)),
            }
        }

        let partition_count = self.topics.get(&record.topic).map_or(1, Vec::len);
        let partition = match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partition_count as u64) as usize
            }
            None => {
                let next = self.next_partition.entry(record.topic.clone()).or_insert(0);
                let p = *next % partition_count;
                *next = next.wrapping_add(1);
                p
            }
        };

        if let Some(log) = self
            .topics
            .get_mut(&record.topic)
            .and_then(|partitions| partitions.get_mut(partition))
        {
            log.push(StoredRecord {
                key: record.key,
                payload: record.payload,
            });
        }
        Ok(())
    }
}

/// Process-local broker shared by every producer and consumer it creates.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
    auto_create: Option<i32>,
}

impl InMemoryBroker {
    /// Broker that rejects writes to topics that were never created.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
            auto_create: None,
        }
    }

    /// Create unknown topics on first write with `partitions` partitions.
    pub fn with_auto_create(mut self, partitions: i32) -> Self {
        self.auto_create = Some(partitions);
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn partitions(&self, topic: &str) -> Option<i32> {
        let state = self.state.lock().unwrap();
        state.topics.get(topic).map(|p| p.len() as i32)
    }

    /// Total records ever written to `topic`.
    pub fn topic_len(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        let state = self.state.lock().unwrap();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, r)| BrokerRecord {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: r.key.clone(),
                    payload: r.payload.clone(),
                })
            })
            .collect()
    }

    pub fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state.committed.get(&(group.to_string(), tp.clone())).copied()
    }

    /// Records of `topic` at or past `group`'s committed offsets.
    pub fn lag(&self, group: &str, topic: &str) -> usize {
        let state = self.state.lock().unwrap();
        let Some(partitions) = state.topics.get(topic) else {
            return 0;
        };
        partitions
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let tp = TopicPartition::new(topic, partition as i32);
                let committed = state
                    .committed
                    .get(&(group.to_string(), tp))
                    .copied()
                    .unwrap_or(0);
                log.len().saturating_sub(committed.max(0) as usize)
            })
            .sum()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for InMemoryBroker {
    fn create_producer(&self, settings: &ProducerSettings) -> QueueResult<Box<dyn Producer>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::broker("in-memory broker is unavailable"));
        }
        Ok(Box::new(InMemoryProducer {
            state: self.state.clone(),
            available: self.available.clone(),
            auto_create: self.auto_create,
            transactional: settings.transactional_id.is_some(),
            pending: Vec::new(),
            transaction: None,
        }))
    }

    fn create_consumer(&self, settings: &ConsumerSettings) -> QueueResult<Box<dyn Consumer>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::broker("in-memory broker is unavailable"));
        }
        Ok(Box::new(InMemoryConsumer {
            state: self.state.clone(),
            available: self.available.clone(),
            group: settings.group_id.clone(),
            assignment: Vec::new(),
            positions: HashMap::new(),
            cursor: 0,
        }))
    }

    fn create_topic(&self, topic: &str, partitions: i32, _replication: i32) -> QueueResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::broker("in-memory broker is unavailable"));
        }
        let mut state = self.state.lock().unwrap();
        state.ensure_topic(topic, partitions);
        debug!(topic, partitions, "in-memory topic created");
        Ok(())
    }
}

struct InMemoryProducer {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
    auto_create: Option<i32>,
    transactional: bool,
    pending: Vec<PendingRecord>,
    transaction: Option<Vec<PendingRecord>>,
}

impl InMemoryProducer {
    fn check_available(&self) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::broker("in-memory broker is unavailable"))
        }
    }
}

impl Producer for InMemoryProducer {
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> QueueResult<()> {
        self.check_available()?;
        let record = PendingRecord {
            topic: topic.to_string(),
            key: key.map(<[u8]>::to_vec),
            payload: payload.to_vec(),
        };
        match self.transaction.as_mut() {
            Some(buffer) => buffer.push(record),
            None => self.pending.push(record),
        }
        Ok(())
    }

    fn flush(&mut self, _timeout: Duration) -> QueueResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let mut first_error = None;
        for record in self.pending.drain(..) {
            if let Err(e) = state.append(record, self.auto_create) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.transaction.as_ref().map_or(0, Vec::len)
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn begin_transaction(&mut self) -> QueueResult<()> {
        if !self.transactional {
            return Err(QueueError::TransactionAbort(
                "producer has no transactional id".into(),
            ));
        }
        if self.transaction.is_some() {
            return Err(QueueError::TransactionAbort(
                "transaction already in progress".into(),
            ));
        }
        self.check_available()?;
        self.transaction = Some(Vec::new());
        Ok(())
    }

    fn commit_transaction(&mut self, _timeout: Duration) -> QueueResult<()> {
        let Some(buffer) = self.transaction.take() else {
            return Err(QueueError::TransactionAbort(
                "no transaction in progress".into(),
            ));
        };
        self.check_available()?;

        let mut state = self.state.lock().unwrap();
        if self.auto_create.is_none() {
            if let Some(missing) = buffer.iter().find(|r| !state.topics.contains_key(&r.topic)) {
                return Err(QueueError::UnknownTopic(missing.topic.clone()));
            }
        }
        for record in buffer {
            state.append(record, self.auto_create)?;
        }
        Ok(())
    }

    fn abort_transaction(&mut self, _timeout: Duration) -> QueueResult<()> {
        // Records of an aborted transaction are never visible.
        self.transaction = None;
        Ok(())
    }
}

struct InMemoryConsumer {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
    group: String,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    cursor: usize,
}

impl Consumer for InMemoryConsumer {
    fn assign(&mut self, partitions: &[TopicPartition]) -> QueueResult<()> {
        let state = self.state.lock().unwrap();
        self.positions = partitions
            .iter()
            .map(|tp| {
                let committed = state
                    .committed
                    .get(&(self.group.clone(), tp.clone()))
                    .copied()
                    .unwrap_or(0);
                (tp.clone(), committed)
            })
            .collect();
        self.assignment = partitions.to_vec();
        self.cursor = 0;
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.clone()
    }

    fn partition_count(&mut self, topic: &str) -> QueueResult<i32> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::broker("in-memory broker is unavailable"));
        }
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|p| p.len() as i32)
            .ok_or_else(|| QueueError::UnknownTopic(topic.to_string()))
    }

    fn poll(&mut self, _timeout: Duration) -> PollOutcome {
        if !self.available.load(Ordering::SeqCst) {
            return PollOutcome::Error("in-memory broker is unavailable".into());
        }
        if self.assignment.is_empty() {
            return PollOutcome::Timeout;
        }

        let state = self.state.lock().unwrap();
        let n = self.assignment.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let tp = &self.assignment[idx];
            let position = self.positions.get(tp).copied().unwrap_or(0);
            let record = state
                .topics
                .get(&tp.topic)
                .and_then(|partitions| partitions.get(tp.partition as usize))
                .and_then(|log| log.get(position as usize));

            if let Some(record) = record {
                let delivered = BrokerRecord {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: position,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                };
                self.positions.insert(tp.clone(), position + 1);
                self.cursor = idx + 1;
                return PollOutcome::Delivered(delivered);
            }
        }

        PollOutcome::Empty
    }

    fn commit(&mut self, record: &BrokerRecord) -> QueueResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::broker("in-memory broker is unavailable"));
        }
        let mut state = self.state.lock().unwrap();
        state.committed.insert(
            (
                self.group.clone(),
                TopicPartition::new(record.topic.clone(), record.partition),
            ),
            record.offset + 1,
        );
        Ok(())
    }

    fn unassign(&mut self) -> QueueResult<()> {
        self.assignment.clear();
        self.positions.clear();
        self.cursor = 0;
        Ok(())
    }
}
