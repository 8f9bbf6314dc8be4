//! Infrastructure layer: broker clients, connection pooling, partition
//! ownership, idempotency/dead-letter stores, configuration providers and
//! the Kafka queue connector built on top of them.

pub mod broker;
pub mod config;
pub mod connector;
pub mod context;
pub mod dead_letter;
pub mod health;
pub mod idempotency;
pub mod partition;
pub mod pool;
pub mod transaction;

mod integration_tests;

pub use broker::{
    Broker, BrokerRecord, Consumer, ConsumerSettings, InMemoryBroker, PollOutcome, Producer,
    ProducerSettings, TopicPartition,
};
#[cfg(feature = "kafka")]
pub use broker::KafkaBroker;
pub use config::{ConfigProvider, ConfigValidator, ConnectorConfig, HotReloadManager};
pub use connector::{Job, KafkaConnector};
pub use context::{ConnectorContext, ConnectorContextBuilder};
pub use dead_letter::{DeadLetterQueue, DeadLetterRecord, InMemoryListStore, ListStore};
pub use health::{HealthRecord, HealthRegistry, HealthStatus};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
pub use partition::{ConsumerRegistry, InMemoryConsumerRegistry, PartitionManager};
pub use pool::{ConnectionPool, PoolConfig, PoolRegistry, ProducerPool};
pub use transaction::KafkaTransaction;
