//! Queue publishing/consuming abstraction (mechanics only).
//!
//! ## Delivery guarantees
//!
//! Delivery is **at-least-once**: a popped job stays unacknowledged until the
//! caller finishes it, and is redelivered if the process dies first.
//! Idempotent *effects* come from the connector's dedup store, not from the
//! broker.
//!
//! ## Usage pattern
//!
//! ```ignore
//! let queue: Arc<KafkaConnector> = ...;
//!
//! while !token.is_cancelled() {
//!     match queue.pop(Some("mail"))? {
//!         Some(job) => match send_email(job.context().data) {
//!             Ok(()) => job.delete()?,
//!             Err(e) => { job.release(Duration::from_secs(10))?; }
//!         },
//!         None => continue, // empty poll, redirect or duplicate skip
//!     }
//! }
//! ```

use std::time::Duration;

use jobline_core::{JobData, MessageId, QueueResult};
use serde_json::Value;

use crate::handler::JobContext;
use crate::retry::RetryPolicy;

/// What `release` did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Scheduled for redelivery after `delay`.
    Requeued { attempts: u32, delay: Duration },
    /// Retry budget exhausted; moved to the dead-letter queue.
    DeadLettered { attempts: u32 },
}

/// Queue driver.
///
/// `queue = None` always means the driver's default queue.
pub trait Queue: Send + Sync {
    type Job<'a>: JobHandle
    where
        Self: 'a;

    /// Publish a job. Returns the new message id.
    fn push(&self, job: &str, data: Value, queue: Option<&str>) -> QueueResult<MessageId>;

    /// Publish an already-serialized payload.
    fn push_raw(&self, payload: &[u8], queue: Option<&str>) -> QueueResult<()>;

    /// Publish a job that must not be handed out before `delay` has elapsed.
    fn later(
        &self,
        delay: Duration,
        job: &str,
        data: Value,
        queue: Option<&str>,
    ) -> QueueResult<MessageId>;

    /// Fetch the next deliverable job, if any.
    ///
    /// `Ok(None)` covers empty polls, timeouts, internal redirects and
    /// duplicate skips; callers simply poll again.
    fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Self::Job<'_>>>;

    /// The broker exposes no cheap queue-length primitive.
    fn size(&self, _queue: Option<&str>) -> usize {
        0
    }

    /// Retry budget the queue applies on `release`, if it enforces one.
    /// Workers defer to it over their own configuration.
    fn retry_policy(&self) -> Option<&RetryPolicy> {
        None
    }

    /// Stop consuming. Idempotent.
    fn shutdown(&self);

    fn is_shutting_down(&self) -> bool;
}

/// Consumer-side handle for one delivered message.
///
/// Finishing operations take `self`, so a delivery is acknowledged at most
/// once.
pub trait JobHandle {
    fn id(&self) -> &MessageId;

    fn name(&self) -> &str;

    fn data(&self) -> &JobData;

    fn attempts(&self) -> u32;

    fn queue(&self) -> &str;

    /// Borrowed view handed to handlers.
    fn context(&self) -> JobContext<'_> {
        JobContext {
            id: self.id(),
            name: self.name(),
            data: self.data(),
            attempts: self.attempts(),
            queue: self.queue(),
        }
    }

    /// Acknowledge: the message is done for good.
    fn delete(self) -> QueueResult<()>;

    /// Ask for redelivery after `delay`.
    fn release(self, delay: Duration) -> QueueResult<ReleaseOutcome>;

    /// Declare terminal failure; the message goes to the dead-letter queue.
    fn fail(self, error: &str) -> QueueResult<()>;
}
