pub mod kafka;

use crate::envelope::ProducerRecord;

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a producer handle, either synchronously from `send` or through the ack
/// callback once the delivery outcome is known.
#[derive(Clone, Debug, Error)]
pub enum ProducerError {
    /// The destination terminally rejected the record; it will not be retried by the producer.
    #[error("destination rejected record: {0}")]
    Rejected(String),
    /// The producer's internal queue stayed full past its submit backoff.
    #[error("producer queue full")]
    QueueFull,
    /// Not every outstanding record was acknowledged within the flush timeout.
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),
    /// The producer has been closed and can no longer accept records.
    #[error("producer is closed")]
    Closed,
    /// Any other failure; the caller decides whether to retry.
    #[error("transient producer error: {0}")]
    Transient(String),
}

/// Callback invoked exactly once per submitted record with the terminal delivery outcome: `Ok`
/// when the destination durably accepted the record, `Err` when delivery terminally failed.
/// Producer-internal retries happen before the callback fires.
pub type AckCallback = Box<dyn FnOnce(Result<(), ProducerError>) + Send>;

/// Contract for the transport that carries envelopes to a destination. Implementations must be
/// safe to call from the task loop thread while acknowledgements arrive on their own threads,
/// and must preserve submission order per destination partition.
pub trait ProducerHandle: Send + Sync {
    /// Schedules delivery of the record. On `Ok` the ack callback will be invoked exactly once
    /// with the terminal outcome; on `Err` the record was not scheduled and the callback is
    /// never invoked.
    fn send(&self, record: ProducerRecord, ack: AckCallback) -> Result<(), ProducerError>;
    /// Blocks until every previously submitted record has been terminally acknowledged, or the
    /// timeout elapses.
    fn flush(&self, timeout: Duration) -> Result<(), ProducerError>;
}
