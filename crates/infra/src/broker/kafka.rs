//! Kafka broker backed by librdkafka.
//!
//! - Producers are `BaseProducer`s with a delivery-tracking context, so
//!   failed deliveries (e.g. unknown topic) surface from `flush`.
//! - Consumers are `BaseConsumer`s with manual `assign` and
//!   `enable.auto.commit=false`; offsets are committed only on ack.
//! - Topic creation goes through the admin client on a private
//!   current-thread runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::{ClientContext, DefaultClientContext};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer as _};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer as _, ProducerContext};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use jobline_core::{QueueError, QueueResult};

use super::{
    Broker, BrokerRecord, Consumer, ConsumerSettings, PollOutcome, Producer, ProducerSettings,
    TopicPartition,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const INIT_TRANSACTIONS_TIMEOUT: Duration = Duration::from_secs(30);

fn broker_error(err: KafkaError) -> QueueError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            QueueError::UnknownTopic(err.to_string())
        }
        Some(RDKafkaErrorCode::OperationTimedOut) | Some(RDKafkaErrorCode::RequestTimedOut) => {
            QueueError::timeout(err.to_string())
        }
        _ => QueueError::broker(err.to_string()),
    }
}

/// Kafka cluster reached through `bootstrap.servers`.
pub struct KafkaBroker {
    admin: AdminClient<DefaultClientContext>,
    runtime: tokio::runtime::Runtime,
}

impl KafkaBroker {
    /// `properties` are applied to the admin client (at least
    /// `bootstrap.servers`).
    pub fn new<'a>(
        properties: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> QueueResult<Self> {
        let mut config = ClientConfig::new();
        for (k, v) in properties {
            config.set(k.as_str(), v.as_str());
        }
        let admin: AdminClient<DefaultClientContext> = config.create().map_err(broker_error)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| QueueError::broker(format!("admin runtime: {e}")))?;

        Ok(Self { admin, runtime })
    }
}

impl core::fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KafkaBroker").finish_non_exhaustive()
    }
}

fn client_config(properties: &std::collections::BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (k, v) in properties {
        config.set(k.as_str(), v.as_str());
    }
    config
}

impl Broker for KafkaBroker {
    fn create_producer(&self, settings: &ProducerSettings) -> QueueResult<Box<dyn Producer>> {
        let mut config = client_config(&settings.properties);
        if let Some(txn_id) = &settings.transactional_id {
            config
                .set("transactional.id", txn_id.as_str())
                .set("enable.idempotence", "true")
                .set("acks", "all");
        }

        let tracker = DeliveryTracker::default();
        let producer: BaseProducer<DeliveryTracker> = config
            .create_with_context(tracker.clone())
            .map_err(broker_error)?;

        if settings.transactional_id.is_some() {
            producer
                .init_transactions(Timeout::After(INIT_TRANSACTIONS_TIMEOUT))
                .map_err(|e| QueueError::TransactionAbort(e.to_string()))?;
        }

        Ok(Box::new(KafkaProducer {
            producer,
            tracker,
            transactional: settings.transactional_id.is_some(),
        }))
    }

    fn create_consumer(&self, settings: &ConsumerSettings) -> QueueResult<Box<dyn Consumer>> {
        let mut config = client_config(&settings.properties);
        config
            .set("group.id", settings.group_id.as_str())
            .set("enable.auto.commit", "false");

        let consumer: BaseConsumer = config.create().map_err(broker_error)?;
        Ok(Box::new(KafkaConsumer {
            consumer,
            assignment: Vec::new(),
        }))
    }

    fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> QueueResult<()> {
        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication));
        let opts = AdminOptions::new().operation_timeout(Some(Timeout::After(METADATA_TIMEOUT)));

        let results = self
            .runtime
            .block_on(self.admin.create_topics(&[new_topic], &opts))
            .map_err(broker_error)?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, partitions, "topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "topic already exists")
                }
                Err((name, code)) => {
                    return Err(QueueError::broker(format!(
                        "create topic {name} failed: {code}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Remembers the first delivery failure since the last flush.
#[derive(Clone, Default)]
struct DeliveryTracker {
    failure: Arc<Mutex<Option<QueueError>>>,
}

impl DeliveryTracker {
    fn take_failure(&self) -> Option<QueueError> {
        self.failure.lock().ok().and_then(|mut f| f.take())
    }
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        if let Err((err, msg)) = result {
            warn!(topic = msg.topic(), error = %err, "kafka delivery failed");
            if let Ok(mut failure) = self.failure.lock() {
                failure.get_or_insert_with(|| match err.rdkafka_error_code() {
                    Some(RDKafkaErrorCode::UnknownTopicOrPartition)
                    | Some(RDKafkaErrorCode::UnknownTopic) => {
                        QueueError::UnknownTopic(msg.topic().to_string())
                    }
                    _ => QueueError::broker(err.to_string()),
                });
            }
        }
    }
}

struct KafkaProducer {
    producer: BaseProducer<DeliveryTracker>,
    tracker: DeliveryTracker,
    transactional: bool,
}

impl Producer for KafkaProducer {
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> QueueResult<()> {
        let mut record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.producer
            .send(record)
            .map_err(|(err, _)| broker_error(err))?;
        self.producer.poll(Duration::ZERO);
        Ok(())
    }

    fn flush(&mut self, timeout: Duration) -> QueueResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(broker_error)?;
        match self.tracker.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn begin_transaction(&mut self) -> QueueResult<()> {
        self.producer
            .begin_transaction()
            .map_err(|e| QueueError::TransactionAbort(e.to_string()))
    }

    fn commit_transaction(&mut self, timeout: Duration) -> QueueResult<()> {
        self.producer
            .commit_transaction(Timeout::After(timeout))
            .map_err(|e| QueueError::TransactionAbort(e.to_string()))?;
        match self.tracker.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn abort_transaction(&mut self, timeout: Duration) -> QueueResult<()> {
        self.producer
            .abort_transaction(Timeout::After(timeout))
            .map_err(|e| QueueError::TransactionAbort(e.to_string()))
    }
}

struct KafkaConsumer {
    consumer: BaseConsumer,
    assignment: Vec<TopicPartition>,
}

impl Consumer for KafkaConsumer {
    fn assign(&mut self, partitions: &[TopicPartition]) -> QueueResult<()> {
        let mut tpl = TopicPartitionList::new();
        for tp in partitions {
            // No explicit offset: resume from the group's committed offset.
            tpl.add_partition(&tp.topic, tp.partition);
        }
        self.consumer.assign(&tpl).map_err(broker_error)?;
        self.assignment = partitions.to_vec();
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.clone()
    }

    fn partition_count(&mut self, topic: &str) -> QueueResult<i32> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(broker_error)?;

        match metadata.topics().iter().find(|t| t.name() == topic) {
            Some(t) if t.error().is_none() && !t.partitions().is_empty() => {
                Ok(t.partitions().len() as i32)
            }
            _ => Err(QueueError::UnknownTopic(topic.to_string())),
        }
    }

    fn poll(&mut self, timeout: Duration) -> PollOutcome {
        match self.consumer.poll(timeout) {
            None => PollOutcome::Timeout,
            Some(Ok(msg)) => PollOutcome::Delivered(BrokerRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Some(Err(KafkaError::PartitionEOF(_))) => PollOutcome::Empty,
            Some(Err(err)) => PollOutcome::Error(err.to_string()),
        }
    }

    fn commit(&mut self, record: &BrokerRecord) -> QueueResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(broker_error)?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(broker_error)
    }

    fn unassign(&mut self) -> QueueResult<()> {
        self.assignment.clear();
        self.consumer.unassign().map_err(broker_error)
    }
}
