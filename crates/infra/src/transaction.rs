//! Transactional publish: begin → produce → commit, abort on any failure.

use std::time::Duration;

use tracing::{debug, warn};

use jobline_core::{QueueError, QueueResult};

use crate::broker::Producer;

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Committed,
    Aborted,
}

/// An open transaction on a transactional producer.
///
/// Dropping it without `commit` aborts it.
pub struct KafkaTransaction<'p> {
    producer: &'p mut dyn Producer,
    timeout: Duration,
    state: TxnState,
}

impl<'p> KafkaTransaction<'p> {
    pub fn begin(producer: &'p mut dyn Producer, timeout: Duration) -> QueueResult<Self> {
        if !producer.is_transactional() {
            return Err(QueueError::TransactionAbort(
                "producer is not transactional".into(),
            ));
        }
        producer.begin_transaction()?;
        debug!("transaction started");
        Ok(Self {
            producer,
            timeout,
            state: TxnState::Open,
        })
    }

    /// Run `body` inside a transaction and commit it. Any error from `body`
    /// or from the commit aborts the transaction and is returned unchanged.
    pub fn run<T>(
        producer: &'p mut dyn Producer,
        timeout: Duration,
        body: impl FnOnce(&mut KafkaTransaction<'p>) -> QueueResult<T>,
    ) -> QueueResult<T> {
        let mut txn = Self::begin(producer, timeout)?;
        match body(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort_quietly(&err);
                Err(err)
            }
        }
    }

    pub fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> QueueResult<()> {
        self.producer.send(topic, key, payload)
    }

    pub fn commit(mut self) -> QueueResult<()> {
        match self.producer.commit_transaction(self.timeout) {
            Ok(()) => {
                self.state = TxnState::Committed;
                debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                self.abort_quietly(&err);
                Err(err)
            }
        }
    }

    pub fn abort(mut self) -> QueueResult<()> {
        self.state = TxnState::Aborted;
        self.producer.abort_transaction(self.timeout)
    }

    fn abort_quietly(&mut self, cause: &QueueError) {
        self.state = TxnState::Aborted;
        match self.producer.abort_transaction(self.timeout) {
            Ok(()) => warn!(error = %cause, "transaction aborted"),
            Err(e) => warn!(error = %cause, abort_error = %e, "transaction abort failed"),
        }
    }
}

impl Drop for KafkaTransaction<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Open {
            self.abort_quietly(&QueueError::TransactionAbort(
                "transaction dropped before commit".into(),
            ));
        }
    }
}
