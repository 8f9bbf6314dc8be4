//! Kafka-backed queue driver.
//!
//! ## Topics
//!
//! Each logical queue `q` maps to two topics: `q` for live messages and
//! `q_delayed` for messages published with [`Queue::later`]. A consumer
//! subscribed to `q` reads both; a delayed record that is due is moved to
//! `q`, one that is not due yet is re-appended to `q_delayed`.
//!
//! ## Acknowledgement
//!
//! Offsets are committed manually, one record at a time, and only after the
//! record's fate is settled (deleted, re-published or dead-lettered). A
//! [`Job`] dropped without being settled rewinds the consumer to the last
//! committed offsets at the next `pop`.

mod job;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use jobline_core::{
    ConsumerIdentity, DELAYED_SUFFIX, Envelope, MessageId, QueueError, QueueResult, delayed_topic,
    is_delayed_topic,
};
use jobline_observability::{ErrorContext, QueueCounter};
use jobline_queue::{Queue, ReleaseOutcome, RetryPolicy, ShutdownToken};

use crate::broker::{BrokerRecord, Consumer, PollOutcome, TopicPartition};
use crate::config::ConnectorConfig;
use crate::context::ConnectorContext;
use crate::dead_letter::{DeadLetterRecord, RetrySummary};
use crate::health::{HealthRecord, HealthStatus};
use crate::partition::PartitionManager;
use crate::pool::{ConnectionPool, ProducerFactory, ProducerPool};
use crate::transaction::KafkaTransaction;

pub use job::Job;

/// Name of the producer pool in the context's [`PoolRegistry`](crate::pool::PoolRegistry).
pub const PRODUCER_POOL: &str = "kafka";

struct Subscription {
    queue: String,
    topics: Vec<String>,
    last_rebalance: DateTime<Utc>,
}

#[derive(Default)]
struct ConsumerSlot {
    consumer: Option<Box<dyn Consumer>>,
    subscription: Option<Subscription>,
    /// Topics this instance is registered for in the consumer registry.
    registered: BTreeSet<String>,
    /// Set when a delivered record was left unsettled; the next `pop`
    /// re-assigns so reading resumes from the committed offsets.
    needs_reassign: bool,
}

pub struct KafkaConnector {
    config: ConnectorConfig,
    ctx: ConnectorContext,
    identity: ConsumerIdentity,
    pool: Arc<ProducerPool>,
    partitions: PartitionManager,
    retry: RetryPolicy,
    slot: Mutex<ConsumerSlot>,
    shutdown: ShutdownToken,
}

impl KafkaConnector {
    /// Validate `config` and wire a connector over `ctx`. Connectors built
    /// from clones of one context share its producer pool and stores.
    pub fn new(config: ConnectorConfig, ctx: ConnectorContext) -> QueueResult<Self> {
        if let Err(e) = config.validate() {
            ctx.reporter
                .report(&e, ErrorContext::new("connector", "validate_config"));
            return Err(e);
        }

        let pool = ctx.pools.get_or_create(PRODUCER_POOL, || {
            let factory = ProducerFactory::new(
                ctx.broker.clone(),
                config.producer_settings(),
                config.flush_timeout(),
            );
            ConnectionPool::new(PRODUCER_POOL, factory, config.pool.clone(), ctx.metrics.clone())
        })?;

        let identity = ConsumerIdentity::generate();
        let partitions = PartitionManager::new(
            ctx.consumers.clone(),
            ctx.clock.clone(),
            config.rebalance_interval(),
            config.consumer_ttl(),
        );

        ctx.health.update(
            &identity.key(),
            HealthStatus::Active,
            [
                ("group_id".to_string(), json!(config.group_id)),
                ("brokers".to_string(), json!(config.brokers)),
            ],
        );
        info!(
            consumer = %identity,
            brokers = %config.brokers,
            default_queue = %config.default_queue,
            transactional = config.is_transactional(),
            "connector ready"
        );

        Ok(Self {
            retry: config.retry_policy(),
            config,
            ctx,
            identity,
            pool,
            partitions,
            slot: Mutex::new(ConsumerSlot::default()),
            shutdown: ShutdownToken::new(),
        })
    }

    pub fn identity(&self) -> &ConsumerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    /// Cancelled by [`Queue::shutdown`].
    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub fn health(&self) -> Option<HealthRecord> {
        self.ctx.health.get(&self.identity.key())
    }

    /// Partitions currently assigned to this instance's consumer.
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let slot = self.slot.lock().unwrap();
        slot.consumer
            .as_ref()
            .map(|c| c.assignment())
            .unwrap_or_default()
    }

    /// Re-publish dead letter `index` of `queue` and drop it from the list.
    pub fn retry_dead_letter(&self, queue: &str, index: usize) -> QueueResult<DeadLetterRecord> {
        self.ctx
            .dead_letters
            .retry(queue, index, |record| self.republish_dead_letter(record))
    }

    /// Re-publish every dead letter of `queue`. Records that fail to publish
    /// stay in the list.
    pub fn retry_all_dead_letters(&self, queue: &str) -> QueueResult<RetrySummary> {
        self.ctx
            .dead_letters
            .retry_all(queue, |record| self.republish_dead_letter(record))
    }

    fn resolve<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.config.default_queue)
    }

    fn consumer_id(&self) -> String {
        self.identity.key()
    }

    /// Jobs settled after shutdown keep the `shutting_down` status.
    fn set_health(&self, status: HealthStatus) {
        if self.is_shutting_down() && status != HealthStatus::ShuttingDown {
            return;
        }
        self.ctx.health.set_status(&self.consumer_id(), status);
    }

    fn report(&self, err: &QueueError, context: ErrorContext) {
        self.ctx
            .reporter
            .report(err, context.tag("consumer", self.consumer_id()));
    }

    // ---- write path -------------------------------------------------------

    /// Deliver one record, creating the topic once if the broker does not
    /// know it and auto-creation is enabled.
    #[instrument(level = "debug", skip(self, key, payload), fields(bytes = payload.len()), err)]
    fn write(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> QueueResult<()> {
        match self.write_once(topic, key, payload) {
            Err(QueueError::UnknownTopic(_)) if self.config.auto_create_topics => {
                self.create_topic(topic)?;
                self.write_once(topic, key, payload)
                    .map_err(|e| still_unknown(topic, e))
            }
            Err(QueueError::UnknownTopic(_)) => Err(QueueError::broker(format!(
                "topic {topic} does not exist and auto-creation is disabled"
            ))),
            other => other,
        }
    }

    fn write_once(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> QueueResult<()> {
        let mut producer = self.pool.get()?;
        let result = if producer.is_transactional() {
            KafkaTransaction::run(&mut **producer, self.config.transaction_timeout(), |txn| {
                txn.send(topic, key, payload)
            })
        } else {
            producer
                .send(topic, key, payload)
                .and_then(|()| producer.flush(self.config.flush_timeout()))
        };
        if result.is_err() {
            // Records still buffered in a failed producer must not leak into
            // a later flush.
            producer.discard();
        }
        result
    }

    fn create_topic(&self, topic: &str) -> QueueResult<()> {
        self.ctx.broker.create_topic(
            topic,
            self.config.topic_partitions,
            self.config.replication_factor,
        )?;
        info!(topic, partitions = self.config.topic_partitions, "topic auto-created");
        Ok(())
    }

    fn publish(
        &self,
        queue: &str,
        topic: &str,
        envelope: &Envelope,
        action: &str,
    ) -> QueueResult<MessageId> {
        let id = envelope.message_id().clone();
        let result = envelope
            .to_bytes()
            .and_then(|bytes| self.write(topic, Some(id.as_str().as_bytes()), &bytes));

        match result {
            Ok(()) => {
                self.ctx.metrics.increment(QueueCounter::Pushed, queue);
                debug!(queue, topic, message_id = %id, job = envelope.job(), "message published");
                Ok(id)
            }
            Err(e) => {
                self.ctx.metrics.increment(QueueCounter::PushFailed, queue);
                self.report(
                    &e,
                    ErrorContext::new("connector", action)
                        .queue(queue)
                        .message_id(id.as_str()),
                );
                Err(e)
            }
        }
    }

    fn republish_dead_letter(&self, record: &DeadLetterRecord) -> QueueResult<()> {
        match &record.payload {
            // Undecodable deliveries are kept as their raw text.
            Value::String(raw) => self.write(&record.queue, None, raw.as_bytes()),
            payload => {
                let envelope: Envelope = serde_json::from_value(payload.clone())?;
                let envelope = envelope.into_live().reset_attempts();
                self.write(
                    &record.queue,
                    Some(envelope.message_id().as_str().as_bytes()),
                    &envelope.to_bytes()?,
                )?;
                info!(
                    queue = %record.queue,
                    message_id = %record.message_id,
                    "dead letter re-published"
                );
                Ok(())
            }
        }
    }

    // ---- read path --------------------------------------------------------

    /// Make sure the consumer exists and reads `queue` and its delayed topic.
    fn ensure_subscribed(&self, slot: &mut ConsumerSlot, queue: &str) -> QueueResult<()> {
        let current = slot.subscription.as_ref().is_some_and(|s| s.queue == queue);
        if current && !slot.needs_reassign {
            return Ok(());
        }

        if slot.consumer.is_none() {
            slot.consumer = Some(
                self.ctx
                    .broker
                    .create_consumer(&self.config.consumer_settings())?,
            );
        }

        if !current {
            if let Some(old) = slot.subscription.take() {
                for topic in &old.topics {
                    self.partitions.unregister_consumer(topic, &self.identity)?;
                    slot.registered.remove(topic);
                }
            }
        }

        let topics = vec![queue.to_string(), delayed_topic(queue)];
        self.set_health(HealthStatus::Rebalancing);
        for topic in &topics {
            self.partitions.register_consumer(topic, &self.identity)?;
            slot.registered.insert(topic.clone());
        }

        let assignment = self.compute_assignment(slot, &topics)?;
        consumer_of(slot)?.assign(&assignment)?;
        slot.needs_reassign = false;
        slot.subscription = Some(Subscription {
            queue: queue.to_string(),
            topics,
            last_rebalance: self.ctx.clock.now(),
        });

        self.ctx.health.update(
            &self.consumer_id(),
            HealthStatus::Consuming,
            [("queue".to_string(), json!(queue))],
        );
        info!(queue, consumer = %self.identity, partitions = assignment.len(), "subscribed");
        Ok(())
    }

    fn compute_assignment(
        &self,
        slot: &mut ConsumerSlot,
        topics: &[String],
    ) -> QueueResult<Vec<TopicPartition>> {
        let consumer = consumer_of(slot)?;
        let mut assignment = Vec::new();
        for topic in topics {
            let count = self.partition_count(consumer, topic)?;
            let owned = self
                .partitions
                .get_consumer_partitions(topic, &self.identity, count)?;
            self.ctx
                .metrics
                .set_assigned_partitions(topic, owned.len() as i64);
            assignment.extend(owned.into_iter().map(|p| TopicPartition::new(topic.clone(), p)));
        }
        assignment.sort();
        Ok(assignment)
    }

    fn partition_count(&self, consumer: &mut dyn Consumer, topic: &str) -> QueueResult<i32> {
        match consumer.partition_count(topic) {
            Err(QueueError::UnknownTopic(_)) if self.config.auto_create_topics => {
                self.create_topic(topic)?;
                consumer
                    .partition_count(topic)
                    .map_err(|e| still_unknown(topic, e))
            }
            Err(QueueError::UnknownTopic(_)) => Err(QueueError::broker(format!(
                "topic {topic} does not exist and auto-creation is disabled"
            ))),
            other => other,
        }
    }

    /// Recompute this instance's share once the rebalance interval elapsed.
    /// The consumer is only re-assigned when the share actually changed.
    fn maybe_rebalance(&self, slot: &mut ConsumerSlot) -> QueueResult<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        let Some(sub) = slot.subscription.as_ref() else {
            return Ok(());
        };
        if !self.partitions.need_rebalance(&sub.queue, sub.last_rebalance) {
            return Ok(());
        }
        let queue = sub.queue.clone();
        let topics = sub.topics.clone();

        self.set_health(HealthStatus::Rebalancing);
        for topic in &topics {
            self.partitions.register_consumer(topic, &self.identity)?;
        }

        let assignment = self.compute_assignment(slot, &topics)?;
        let consumer = consumer_of(slot)?;
        let mut previous = consumer.assignment();
        previous.sort();
        if previous != assignment {
            consumer.assign(&assignment)?;
            self.ctx.metrics.increment(QueueCounter::Rebalanced, &queue);
            info!(
                queue = %queue,
                consumer = %self.identity,
                before = previous.len(),
                after = assignment.len(),
                "partitions rebalanced"
            );
        }

        if let Some(sub) = slot.subscription.as_mut() {
            sub.last_rebalance = self.ctx.clock.now();
        }
        self.set_health(HealthStatus::Consuming);
        Ok(())
    }

    fn commit(&self, slot: &mut ConsumerSlot, record: &BrokerRecord) -> QueueResult<()> {
        consumer_of(slot)?.commit(record)
    }

    /// Decide what a delivered record becomes: a job, a redirect or a skip.
    fn handle_record<'c>(
        &'c self,
        slot: &mut ConsumerSlot,
        queue: &str,
        record: BrokerRecord,
    ) -> QueueResult<Option<Job<'c>>> {
        let envelope = match Envelope::from_slice(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dead_letter_malformed(slot, queue, &record, &e)?;
                return Ok(None);
            }
        };

        if is_delayed_topic(&record.topic) {
            self.redirect_delayed(slot, &record, envelope)?;
            return Ok(None);
        }

        if self
            .ctx
            .idempotency
            .is_processed(envelope.message_id(), &record.topic)?
        {
            self.commit(slot, &record)?;
            self.ctx
                .metrics
                .increment(QueueCounter::DuplicateSkipped, &record.topic);
            debug!(
                queue = %record.topic,
                message_id = %envelope.message_id(),
                "duplicate delivery skipped"
            );
            return Ok(None);
        }

        self.ctx.health.update(
            &self.consumer_id(),
            HealthStatus::Processing,
            [("message_id".to_string(), json!(envelope.message_id()))],
        );
        self.ctx.metrics.increment(QueueCounter::Popped, queue);
        debug!(
            queue,
            message_id = %envelope.message_id(),
            job = envelope.job(),
            attempts = envelope.attempts(),
            partition = record.partition,
            offset = record.offset,
            "job delivered"
        );
        Ok(Some(Job::new(self, record, envelope)))
    }

    fn redirect_delayed(
        &self,
        slot: &mut ConsumerSlot,
        record: &BrokerRecord,
        envelope: Envelope,
    ) -> QueueResult<()> {
        let target = envelope
            .original_queue()
            .map(str::to_string)
            .unwrap_or_else(|| record.topic.trim_end_matches(DELAYED_SUFFIX).to_string());

        if envelope.is_due(self.ctx.clock.unix_now()) {
            let live = envelope.into_live();
            self.write(
                &target,
                Some(live.message_id().as_str().as_bytes()),
                &live.to_bytes()?,
            )?;
            self.commit(slot, record)?;
            self.ctx.metrics.increment(QueueCounter::DelayPromoted, &target);
            debug!(queue = %target, message_id = %live.message_id(), "delayed message promoted");
        } else {
            self.write(&record.topic, record.key.as_deref(), &record.payload)?;
            self.commit(slot, record)?;
            self.ctx.metrics.increment(QueueCounter::DelayRequeued, &target);
            debug!(
                queue = %target,
                message_id = %envelope.message_id(),
                available_at = envelope.available_at(),
                "delayed message not due, re-queued"
            );
        }
        Ok(())
    }

    fn dead_letter_malformed(
        &self,
        slot: &mut ConsumerSlot,
        queue: &str,
        record: &BrokerRecord,
        err: &QueueError,
    ) -> QueueResult<()> {
        let coordinates = record.coordinates();
        let raw = String::from_utf8_lossy(&record.payload).into_owned();
        self.ctx.dead_letters.add(
            &coordinates,
            queue,
            Value::String(raw),
            &format!("malformed message: {err}"),
            1,
        )?;
        self.commit(slot, record)?;
        self.ctx.metrics.increment(QueueCounter::Malformed, queue);
        self.report(
            err,
            ErrorContext::new("connector", "decode")
                .queue(queue)
                .message_id(coordinates),
        );
        Ok(())
    }

    // ---- job settlement ---------------------------------------------------

    fn acknowledge(&self, record: &BrokerRecord) -> QueueResult<()> {
        let mut slot = self.slot.lock().unwrap();
        self.commit(&mut slot, record)
    }

    fn complete_job(
        &self,
        record: &BrokerRecord,
        envelope: &Envelope,
        queue: &str,
        elapsed: Duration,
    ) -> QueueResult<()> {
        self.ctx
            .idempotency
            .mark_processed(envelope.message_id(), queue)?;
        self.acknowledge(record)?;
        self.ctx.metrics.increment(QueueCounter::Deleted, queue);
        self.ctx
            .metrics
            .observe_processing(queue, elapsed.as_secs_f64());
        self.set_health(HealthStatus::Consuming);
        debug!(queue, message_id = %envelope.message_id(), "job deleted");
        Ok(())
    }

    fn release_job(
        &self,
        record: &BrokerRecord,
        envelope: &Envelope,
        queue: &str,
        delay: Duration,
    ) -> QueueResult<ReleaseOutcome> {
        let attempts = envelope.attempts().saturating_add(1);
        if !self.retry.should_retry(attempts) {
            self.dead_letter(record, envelope, queue, "max attempts exceeded", attempts)?;
            return Ok(ReleaseOutcome::DeadLettered { attempts });
        }

        let next = envelope.clone().next_attempt();
        let key = next.message_id().as_str().as_bytes();
        if delay.is_zero() {
            self.write(queue, Some(key), &next.to_bytes()?)?;
        } else {
            let available_at = self.ctx.clock.unix_now() + ceil_secs(delay);
            let parked = next.clone().delayed_until(available_at, queue);
            self.write(&delayed_topic(queue), Some(key), &parked.to_bytes()?)?;
        }
        self.acknowledge(record)?;

        self.ctx.metrics.increment(QueueCounter::Released, queue);
        self.set_health(HealthStatus::Consuming);
        debug!(
            queue,
            message_id = %envelope.message_id(),
            attempts,
            delay_secs = delay.as_secs(),
            "job released"
        );
        Ok(ReleaseOutcome::Requeued { attempts, delay })
    }

    fn fail_job(
        &self,
        record: &BrokerRecord,
        envelope: &Envelope,
        queue: &str,
        error: &str,
    ) -> QueueResult<()> {
        let attempts = envelope.attempts().saturating_add(1);
        self.dead_letter(record, envelope, queue, error, attempts)?;
        self.ctx.metrics.increment(QueueCounter::Failed, queue);
        Ok(())
    }

    fn dead_letter(
        &self,
        record: &BrokerRecord,
        envelope: &Envelope,
        queue: &str,
        error: &str,
        attempts: u32,
    ) -> QueueResult<()> {
        let payload = serde_json::to_value(envelope)?;
        self.ctx.dead_letters.add(
            envelope.message_id().as_str(),
            queue,
            payload,
            error,
            attempts,
        )?;
        self.acknowledge(record)?;
        self.ctx.metrics.increment(QueueCounter::DeadLettered, queue);
        self.set_health(HealthStatus::Consuming);
        Ok(())
    }

    /// A job could not be settled: make its record readable again.
    fn settle_failed(&self, queue: &str, envelope: &Envelope, action: &str, err: &QueueError) {
        self.report(
            err,
            ErrorContext::new("job", action)
                .queue(queue)
                .message_id(envelope.message_id().as_str()),
        );
        self.rewind();
    }

    fn rewind(&self) {
        self.slot.lock().unwrap().needs_reassign = true;
    }
}

impl Queue for KafkaConnector {
    type Job<'a> = job::Job<'a>;

    #[instrument(skip(self, data), fields(queue = %self.resolve(queue)), err)]
    fn push(&self, job: &str, data: Value, queue: Option<&str>) -> QueueResult<MessageId> {
        let queue = self.resolve(queue);
        let envelope = Envelope::from_value(job, data)?;
        self.publish(queue, queue, &envelope, "push")
    }

    #[instrument(
        skip(self, payload),
        fields(queue = %self.resolve(queue), bytes = payload.len()),
        err
    )]
    fn push_raw(&self, payload: &[u8], queue: Option<&str>) -> QueueResult<()> {
        let queue = self.resolve(queue);
        match self.write(queue, None, payload) {
            Ok(()) => {
                self.ctx.metrics.increment(QueueCounter::Pushed, queue);
                Ok(())
            }
            Err(e) => {
                self.ctx.metrics.increment(QueueCounter::PushFailed, queue);
                self.report(&e, ErrorContext::new("connector", "push_raw").queue(queue));
                Err(e)
            }
        }
    }

    #[instrument(
        skip(self, data),
        fields(queue = %self.resolve(queue), delay_secs = delay.as_secs()),
        err
    )]
    fn later(
        &self,
        delay: Duration,
        job: &str,
        data: Value,
        queue: Option<&str>,
    ) -> QueueResult<MessageId> {
        let queue = self.resolve(queue);
        let available_at = self.ctx.clock.unix_now() + ceil_secs(delay);
        let envelope = Envelope::from_value(job, data)?.delayed_until(available_at, queue);
        self.publish(queue, &delayed_topic(queue), &envelope, "later")
    }

    fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Job<'_>>> {
        if self.is_shutting_down() {
            return Ok(None);
        }
        let queue = self.resolve(queue);
        let mut slot = self.slot.lock().unwrap();

        if let Err(e) = self.ensure_subscribed(&mut slot, queue) {
            self.set_health(HealthStatus::Error);
            self.report(&e, ErrorContext::new("connector", "subscribe").queue(queue));
            return Err(match e {
                QueueError::UnknownTopic(topic) => {
                    QueueError::broker(format!("cannot subscribe to {topic}"))
                }
                other => other,
            });
        }

        // Also the heartbeat. Never run with a record in hand: re-assigning
        // rewinds to the committed offsets.
        if let Err(e) = self.maybe_rebalance(&mut slot) {
            warn!(queue, error = %e, "rebalance failed");
            self.report(&e, ErrorContext::new("connector", "rebalance").queue(queue));
        }

        let outcome = consumer_of(&mut slot)?.poll(self.config.poll_timeout());
        match outcome {
            PollOutcome::Empty | PollOutcome::Timeout => Ok(None),
            PollOutcome::Error(reason) => {
                let err = QueueError::broker(reason);
                self.ctx.metrics.increment(QueueCounter::PollErrors, queue);
                self.set_health(HealthStatus::Error);
                self.report(&err, ErrorContext::new("connector", "poll").queue(queue));
                Err(err)
            }
            PollOutcome::Delivered(record) => {
                let coordinates = record.coordinates();
                match self.handle_record(&mut slot, queue, record) {
                    Ok(job) => Ok(job),
                    Err(e) => {
                        slot.needs_reassign = true;
                        self.report(
                            &e,
                            ErrorContext::new("connector", "pop")
                                .queue(queue)
                                .tag("record", coordinates),
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut slot = self.slot.lock().unwrap();
        if let Some(consumer) = slot.consumer.as_mut() {
            if let Err(e) = consumer.unassign() {
                warn!(error = %e, "unassign failed during shutdown");
            }
        }
        slot.subscription = None;
        for topic in std::mem::take(&mut slot.registered) {
            if let Err(e) = self.partitions.unregister_consumer(&topic, &self.identity) {
                self.report(&e, ErrorContext::new("connector", "shutdown").queue(topic));
            }
        }
        drop(slot);

        self.set_health(HealthStatus::ShuttingDown);
        info!(consumer = %self.identity, "connector shut down");
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        Some(&self.retry)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl core::fmt::Debug for KafkaConnector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KafkaConnector")
            .field("identity", &self.identity)
            .field("default_queue", &self.config.default_queue)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

fn consumer_of(slot: &mut ConsumerSlot) -> QueueResult<&mut (dyn Consumer + 'static)> {
    slot.consumer
        .as_deref_mut()
        .ok_or_else(|| QueueError::broker("consumer not created"))
}

fn still_unknown(topic: &str, err: QueueError) -> QueueError {
    match err {
        QueueError::UnknownTopic(_) => {
            QueueError::broker(format!("topic {topic} still unknown after auto-create"))
        }
        other => other,
    }
}

/// Whole seconds, rounded up, so a delay never ends early.
fn ceil_secs(delay: Duration) -> i64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_round_up_to_whole_seconds() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(5)), 5);
        assert_eq!(ceil_secs(Duration::from_millis(5_500)), 6);
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_is_created() {
        let ctx = ConnectorContext::in_memory();
        let config = ConnectorConfig {
            brokers: String::new(),
            ..ConnectorConfig::default()
        };

        let err = KafkaConnector::new(config, ctx.clone()).unwrap_err();
        assert!(err.is_fatal());
        assert!(ctx.pools.get_pool(PRODUCER_POOL).is_none());
    }

    #[test]
    fn connectors_on_one_context_share_the_producer_pool() {
        let ctx = ConnectorContext::in_memory();
        let a = KafkaConnector::new(ConnectorConfig::default(), ctx.clone()).unwrap();
        let b = KafkaConnector::new(ConnectorConfig::default(), ctx.clone()).unwrap();

        assert!(Arc::ptr_eq(&a.pool, &b.pool));
        assert_ne!(a.identity().key(), b.identity().key());
        assert_eq!(a.health().unwrap().status, HealthStatus::Active);
    }
}
