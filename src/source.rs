pub mod kafka;
pub mod logfile;

use crate::{
    envelope::SourceRecord,
    partition::{PartitionInfo, SourcePartition},
};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// Result type for source adapter operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors surfaced by a source adapter. Only the distinguished variants receive special handling
/// in the task loop; everything else is transient and retried by the caller.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No committed offset exists for the given partitions and the adapter was configured to
    /// surface the condition instead of resetting on its own.
    #[error("no committed offset for partitions {0:?}")]
    NoOffsetForPartitions(HashSet<SourcePartition>),
    /// The source reports that consumption for the given partitions is outside the retained
    /// offset range, keyed by the out-of-range offset where known.
    #[error("offsets out of range: {0:?}")]
    OffsetOutOfRange(HashMap<SourcePartition, i64>),
    /// An in-progress poll was cancelled via [`SourceAdapter::wakeup`].
    #[error("poll interrupted by wakeup")]
    WakeupTriggered,
    /// The adapter has been closed and can no longer serve requests.
    #[error("source adapter is closed")]
    Closed,
    /// Any other failure; the caller retries after a delay.
    #[error("transient source error: {0}")]
    Transient(String),
}

/// What a task subscribes to on its source adapter: either an explicit topic set or a regular
/// expression matched against topic names.
#[derive(Clone, Debug)]
pub enum SubscriptionTarget {
    /// An explicit list of topic names.
    Topics(Vec<String>),
    /// A regular expression matching topic names.
    Pattern(String),
}

/// A batch of records returned by one poll, grouped by source partition. Within each partition
/// records are held in the order they were read, i.e. ascending by offset.
#[derive(Debug, Default)]
pub struct RecordBatch {
    /// Records keyed by the partition they were read from.
    records: BTreeMap<SourcePartition, Vec<SourceRecord>>,
    /// Total number of records in the batch.
    count: usize,
}

impl RecordBatch {
    /// Creates a new, empty [`RecordBatch`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Appends one record to the batch under the partition it was read from.
    pub fn push(&mut self, record: SourceRecord) {
        self.records
            .entry(record.source_partition())
            .or_default()
            .push(record);

        self.count += 1;
    }
    /// Returns true if the batch contains no records.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
    /// Returns the total number of records in the batch across all partitions.
    pub fn len(&self) -> usize {
        self.count
    }
    /// Returns the partitions that contributed records to the batch.
    pub fn partitions(&self) -> impl Iterator<Item = &SourcePartition> {
        self.records.keys()
    }
    /// Iterates the batch partition by partition, each with its records in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (&SourcePartition, &[SourceRecord])> {
        self.records.iter().map(|(p, rs)| (p, rs.as_slice()))
    }
}

/// Operations available to assignment callbacks while a rebalance is in progress. Callbacks must
/// act through this session rather than the adapter so the work happens inside the rebalance,
/// before the adapter hands out any records for the affected partitions.
pub trait AdapterSession {
    /// Pauses consumption of the given partitions.
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()>;
    /// Synchronously commits the given offsets.
    fn commit_sync(&self, offsets: &HashMap<SourcePartition, i64>) -> SourceResult<()>;
    /// Returns the committed offset for the given partition, if one exists.
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>>;
}

/// Receives partition assignment changes from a source adapter. Callbacks are invoked on the
/// task loop thread, from within [`SourceAdapter::poll`], so they observe a consistent view of
/// task state without additional locking.
pub trait AssignmentListener: Send + Sync {
    /// Invoked after the given partitions have been assigned to this adapter, before any of
    /// their records are handed out.
    fn on_assigned(&self, session: &dyn AdapterSession, partitions: &[SourcePartition]);
    /// Invoked when the given partitions are about to be revoked from this adapter.
    fn on_revoked(&self, session: &dyn AdapterSession, partitions: &[SourcePartition]);
}

/// Contract for the systems a task consumes records from. Implementations wrap a partitioned log
/// consumer or a binary log tail reader and are driven by a single task loop thread; `wakeup`
/// and `close` may be called from other threads.
pub trait SourceAdapter: Send + Sync {
    /// Subscribes the adapter to the given target. Exactly one subscription is allowed per
    /// adapter instance; the listener receives every assignment change until close.
    fn subscribe(
        &self,
        target: &SubscriptionTarget,
        listener: Arc<dyn AssignmentListener>,
    ) -> SourceResult<()>;
    /// Polls for records, blocking the caller up to `timeout`. Returns an empty batch when no
    /// records arrived in time.
    fn poll(&self, timeout: Duration) -> SourceResult<RecordBatch>;
    /// Returns the partitions currently assigned to this adapter.
    fn assignment(&self) -> SourceResult<HashSet<SourcePartition>>;
    /// Returns the assigned partitions that are currently paused.
    fn paused(&self) -> SourceResult<HashSet<SourcePartition>>;
    /// Pauses consumption of the given partitions.
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()>;
    /// Resumes consumption of the given partitions.
    fn resume(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()>;
    /// Seeks the given partition to the given offset for the next poll.
    fn seek(&self, partition: &SourcePartition, offset: i64) -> SourceResult<()>;
    /// Seeks the given partitions to the earliest retained offset.
    fn seek_to_beginning(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()>;
    /// Seeks the given partitions to the log end.
    fn seek_to_end(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()>;
    /// Returns the committed offset for the given partition, if one exists.
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>>;
    /// Synchronously commits offsets: the given map when provided, otherwise the adapter's own
    /// notion of consumed positions.
    fn commit_sync(&self, offsets: Option<&HashMap<SourcePartition, i64>>) -> SourceResult<()>;
    /// Returns the partitions of the given topic as reported by the source system.
    fn partitions_for(&self, topic: &str) -> SourceResult<Vec<PartitionInfo>>;
    /// Causes an in-progress or subsequent `poll` to fail with
    /// [`SourceError::WakeupTriggered`]. Safe to call from any thread.
    fn wakeup(&self);
    /// Releases the network and memory resources held by the adapter. Idempotent.
    fn close(&self);
    /// Adapter-specific reaction to offsets reported out of range by the source. The default
    /// implementation only logs.
    fn handle_offset_out_of_range(&self, offsets: &HashMap<SourcePartition, i64>) {
        tracing::warn!("offsets reported out of range: {:?}", offsets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TimestampKind;

    fn record(topic: &str, partition: i32, offset: i64) -> SourceRecord {
        SourceRecord {
            key: None,
            value: Some(vec![0u8]),
            headers: HashMap::new(),
            topic: String::from(topic),
            partition,
            offset,
            timestamp: None,
            timestamp_kind: TimestampKind::None,
        }
    }

    #[test]
    fn batch_groups_records_by_partition_preserving_order() {
        let mut batch = RecordBatch::new();

        batch.push(record("A", 0, 5));
        batch.push(record("B", 1, 0));
        batch.push(record("A", 0, 6));

        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());

        let by_partition: Vec<(&SourcePartition, &[SourceRecord])> = batch.iter().collect();

        assert_eq!(by_partition.len(), 2);

        let (partition, records) = &by_partition[0];
        assert_eq!(partition.to_string(), "A-0");
        assert_eq!(
            records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }
}
