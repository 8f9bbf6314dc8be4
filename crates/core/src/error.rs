//! Queue error model.

use thiserror::Error;

/// Result type used across the queue crates.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error taxonomy.
///
/// Only `ConfigInvalid` is fatal; everything else is surfaced to the consume
/// loop, which retries on its next iteration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Connector configuration failed validation. The connector refuses to start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The broker could not be reached or rejected the request.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A bounded operation (flush, commit, borrow) ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The topic does not exist on the broker.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// A job handler failed while processing a message.
    #[error("job processing failed: {0}")]
    Processing(String),

    /// A transactional publish was aborted.
    #[error("transaction aborted: {0}")]
    TransactionAbort(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A shared store (idempotency, dead-letter, config) failed.
    #[error("store error: {0}")]
    Store(String),

    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The connector has been shut down.
    #[error("queue is shutting down")]
    ShuttingDown,
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    /// Only configuration errors stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::ConfigInvalid(_))
    }

    /// Transient broker-side faults worth another attempt on the next loop.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            QueueError::BrokerUnavailable(_)
                | QueueError::Timeout(_)
                | QueueError::Pool(_)
                | QueueError::Store(_)
        )
    }

    /// Short machine-friendly name, used as a metrics label and report tag.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::ConfigInvalid(_) => "config_invalid",
            QueueError::BrokerUnavailable(_) => "broker_unavailable",
            QueueError::Timeout(_) => "timeout",
            QueueError::UnknownTopic(_) => "unknown_topic",
            QueueError::Processing(_) => "processing",
            QueueError::TransactionAbort(_) => "transaction_abort",
            QueueError::Serialization(_) => "serialization",
            QueueError::Store(_) => "store",
            QueueError::Pool(_) => "pool",
            QueueError::NotFound(_) => "not_found",
            QueueError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(QueueError::config("brokers missing").is_fatal());
        assert!(!QueueError::broker("down").is_fatal());
        assert!(!QueueError::Processing("boom".into()).is_fatal());
    }

    #[test]
    fn broker_faults_are_retriable() {
        assert!(QueueError::timeout("flush").is_retriable());
        assert!(QueueError::broker("down").is_retriable());
        assert!(!QueueError::Serialization("bad".into()).is_retriable());
        assert!(!QueueError::ShuttingDown.is_retriable());
    }
}
