use std::time::{Duration, Instant};

use tracing::warn;

use jobline_core::{Envelope, JobData, MessageId, QueueResult};
use jobline_queue::{JobHandle, ReleaseOutcome};

use super::KafkaConnector;
use crate::broker::BrokerRecord;

/// One delivered message, borrowed from the connector that popped it.
///
/// Exactly one of `delete`, `release` or `fail` settles it. Dropping it
/// unsettled leaves the offset uncommitted and the record is read again.
pub struct Job<'c> {
    connector: &'c KafkaConnector,
    record: BrokerRecord,
    envelope: Envelope,
    delivered_at: Instant,
    settled: bool,
}

impl<'c> Job<'c> {
    pub(super) fn new(
        connector: &'c KafkaConnector,
        record: BrokerRecord,
        envelope: Envelope,
    ) -> Self {
        Self {
            connector,
            record,
            envelope,
            delivered_at: Instant::now(),
            settled: false,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn record(&self) -> &BrokerRecord {
        &self.record
    }

    /// Release with the connector's backoff for the next attempt.
    pub fn release_with_backoff(self) -> QueueResult<ReleaseOutcome> {
        let next = self.envelope.attempts().saturating_add(1);
        let delay = self.connector.retry.delay_for_attempt(next);
        self.release(delay)
    }

    fn settle<T>(
        mut self,
        action: &str,
        op: impl FnOnce(&KafkaConnector, &BrokerRecord, &Envelope, &str) -> QueueResult<T>,
    ) -> QueueResult<T> {
        self.settled = true;
        let connector = self.connector;
        let result = op(connector, &self.record, &self.envelope, &self.record.topic);
        if let Err(e) = &result {
            connector.settle_failed(&self.record.topic, &self.envelope, action, e);
        }
        result
    }
}

impl JobHandle for Job<'_> {
    fn id(&self) -> &MessageId {
        self.envelope.message_id()
    }

    fn name(&self) -> &str {
        self.envelope.job()
    }

    fn data(&self) -> &JobData {
        self.envelope.data()
    }

    fn attempts(&self) -> u32 {
        self.envelope.attempts()
    }

    fn queue(&self) -> &str {
        &self.record.topic
    }

    fn delete(self) -> QueueResult<()> {
        let elapsed = self.delivered_at.elapsed();
        self.settle("delete", |c, record, envelope, queue| {
            c.complete_job(record, envelope, queue, elapsed)
        })
    }

    fn release(self, delay: Duration) -> QueueResult<ReleaseOutcome> {
        self.settle("release", |c, record, envelope, queue| {
            c.release_job(record, envelope, queue, delay)
        })
    }

    fn fail(self, error: &str) -> QueueResult<()> {
        self.settle("fail", |c, record, envelope, queue| {
            c.fail_job(record, envelope, queue, error)
        })
    }
}

impl Drop for Job<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                queue = %self.record.topic,
                message_id = %self.envelope.message_id(),
                "job dropped without being settled; it will be delivered again"
            );
            self.connector.rewind();
        }
    }
}

impl core::fmt::Debug for Job<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Job")
            .field("message_id", self.envelope.message_id())
            .field("job", &self.envelope.job())
            .field("attempts", &self.envelope.attempts())
            .field("coordinates", &self.record.coordinates())
            .finish()
    }
}
