use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QueueError, QueueResult};
use crate::id::MessageId;

/// Suffix of the topic holding delayed messages for a queue.
pub const DELAYED_SUFFIX: &str = "_delayed";

/// Job payload: a JSON object handed to the handler untouched.
pub type JobData = Map<String, Value>;

/// The wire message published to and consumed from a topic.
///
/// Notes:
/// - `message_id` is assigned once at first publish and survives every
///   redelivery; it is the idempotency key.
/// - `available_at` / `original_queue` are only present while the message
///   sits in a delayed topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    job: String,

    #[serde(default)]
    data: JobData,

    message_id: MessageId,

    #[serde(default)]
    attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    available_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_queue: Option<String>,
}

impl Envelope {
    /// Build a fresh envelope for a first publish.
    pub fn new(job: impl Into<String>, data: JobData) -> Self {
        Self::with_id(MessageId::new(), job, data)
    }

    pub fn with_id(message_id: MessageId, job: impl Into<String>, data: JobData) -> Self {
        Self {
            job: job.into(),
            data,
            message_id,
            attempts: 0,
            available_at: None,
            original_queue: None,
        }
    }

    /// Build from an arbitrary JSON value. `null` becomes an empty map;
    /// anything other than an object is rejected.
    pub fn from_value(job: impl Into<String>, data: Value) -> QueueResult<Self> {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(QueueError::Serialization(format!(
                    "job data must be a JSON object, got {other}"
                )));
            }
        };
        Ok(Self::new(job, data))
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn data(&self) -> &JobData {
        &self.data
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn available_at(&self) -> Option<i64> {
        self.available_at
    }

    pub fn original_queue(&self) -> Option<&str> {
        self.original_queue.as_deref()
    }

    /// Park the message until `available_at`, remembering where it belongs.
    pub fn delayed_until(mut self, available_at: i64, queue: impl Into<String>) -> Self {
        self.available_at = Some(available_at);
        self.original_queue = Some(queue.into());
        self
    }

    /// True when the message may be handed to a consumer at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.available_at.map_or(true, |at| at <= now)
    }

    /// Strip delay metadata once the message moves back to its live queue.
    pub fn into_live(mut self) -> Self {
        self.available_at = None;
        self.original_queue = None;
        self
    }

    /// Count one more delivery attempt.
    pub fn next_attempt(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }

    /// Restart the attempt count (a dead letter being retried).
    pub fn reset_attempts(mut self) -> Self {
        self.attempts = 0;
        self
    }

    pub fn to_bytes(&self) -> QueueResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> QueueResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Topic name holding delayed messages for `queue`.
pub fn delayed_topic(queue: &str) -> String {
    format!("{queue}{DELAYED_SUFFIX}")
}

/// True for topics produced by [`delayed_topic`].
pub fn is_delayed_topic(topic: &str) -> bool {
    topic.ends_with(DELAYED_SUFFIX) && topic.len() > DELAYED_SUFFIX.len()
}
