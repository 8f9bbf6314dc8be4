//! Broker abstraction.
//!
//! The connector never talks to a Kafka client directly; it goes through the
//! [`Broker`] factory and the [`Producer`] / [`Consumer`] handles it creates.
//!
//! - **InMemoryBroker**: partitioned logs in process memory (tests/dev)
//! - **KafkaBroker** (`kafka` feature): librdkafka via `rdkafka`
//!
//! Ordinary consume outcomes (nothing to read, poll timeout) are values of
//! [`PollOutcome`], not errors.

pub mod in_memory;
#[cfg(feature = "kafka")]
pub mod kafka;

use std::collections::BTreeMap;
use std::time::Duration;

use jobline_core::QueueResult;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

/// One record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl BrokerRecord {
    /// `topic:partition:offset`, unique per record.
    pub fn coordinates(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// Result of one bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered(BrokerRecord),
    /// Caught up with every assigned partition.
    Empty,
    /// Nothing arrived before the poll timeout.
    Timeout,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Client properties for a producer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Raw client properties (`bootstrap.servers`, `linger.ms`, ...).
    pub properties: BTreeMap<String, String>,
    /// Set when the producer must publish transactionally.
    pub transactional_id: Option<String>,
}

/// Client properties for a consumer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub properties: BTreeMap<String, String>,
}

/// Creates client handles and administers topics.
pub trait Broker: Send + Sync {
    fn create_producer(&self, settings: &ProducerSettings) -> QueueResult<Box<dyn Producer>>;

    fn create_consumer(&self, settings: &ConsumerSettings) -> QueueResult<Box<dyn Consumer>>;

    /// Create a topic. Creating an existing topic is not an error.
    fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> QueueResult<()>;
}

/// Write side of a broker connection. Owned by exactly one borrower at a time.
pub trait Producer: Send {
    /// Enqueue a record for delivery. Delivery errors surface on `flush`.
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> QueueResult<()>;

    /// Wait until every enqueued record is delivered or `timeout` expires.
    fn flush(&mut self, timeout: Duration) -> QueueResult<()>;

    /// Records enqueued but not yet delivered.
    fn in_flight(&self) -> usize;

    fn is_transactional(&self) -> bool;

    fn begin_transaction(&mut self) -> QueueResult<()>;

    fn commit_transaction(&mut self, timeout: Duration) -> QueueResult<()>;

    fn abort_transaction(&mut self, timeout: Duration) -> QueueResult<()>;
}

/// Read side of a broker connection with manual partition assignment and
/// manual offset commits.
pub trait Consumer: Send {
    /// Replace the current assignment. Reading resumes from the group's
    /// committed offsets.
    fn assign(&mut self, partitions: &[TopicPartition]) -> QueueResult<()>;

    fn assignment(&self) -> Vec<TopicPartition>;

    /// Number of partitions of `topic`; `UnknownTopic` if it does not exist.
    fn partition_count(&mut self, topic: &str) -> QueueResult<i32>;

    fn poll(&mut self, timeout: Duration) -> PollOutcome;

    /// Commit the offset after `record` for this consumer's group.
    fn commit(&mut self, record: &BrokerRecord) -> QueueResult<()>;

    fn unassign(&mut self) -> QueueResult<()>;
}

impl<B: Broker + ?Sized> Broker for std::sync::Arc<B> {
    fn create_producer(&self, settings: &ProducerSettings) -> QueueResult<Box<dyn Producer>> {
        (**self).create_producer(settings)
    }

    fn create_consumer(&self, settings: &ConsumerSettings) -> QueueResult<Box<dyn Consumer>> {
        (**self).create_consumer(settings)
    }

    fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> QueueResult<()> {
        (**self).create_topic(topic, partitions, replication)
    }
}
