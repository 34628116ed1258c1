use crate::{
    envelope::ProducerRecord,
    partition::SourcePartition,
    producer::{ProducerError, ProducerHandle},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, warn};

/// Per-partition window of offsets that have been handed to the producer but not yet folded into
/// a committed checkpoint.
#[derive(Debug, Default)]
struct PartitionWindow {
    /// The highest offset known committed before the current window. The checkpoint never moves
    /// below this value.
    base: Option<i64>,
    /// Offsets submitted to the producer whose acknowledgement is still outstanding.
    in_flight: BTreeSet<i64>,
    /// Acknowledged offsets above the checkpoint that are not yet contiguous with it.
    acked: BTreeSet<i64>,
    /// The highest offset such that every offset between the base and it has been acknowledged.
    checkpoint: Option<i64>,
}

impl PartitionWindow {
    /// Records a newly submitted offset. The first offset seen establishes the window base.
    fn track(&mut self, offset: i64) {
        if self.base.is_none() && self.checkpoint.is_none() {
            self.base = Some(offset - 1);
        }

        self.in_flight.insert(offset);
    }
    /// Removes an acknowledged offset from the in-flight set and advances the checkpoint to the
    /// highest contiguous acknowledged offset. Gaps hold the checkpoint back.
    fn ack(&mut self, offset: i64) {
        if !self.in_flight.remove(&offset) {
            debug!("acknowledged offset {} was not in flight", offset);
        }

        self.acked.insert(offset);

        let mut checkpoint = self.checkpoint.or(self.base).unwrap_or(offset - 1);

        while self.acked.remove(&(checkpoint + 1)) {
            checkpoint += 1;
        }

        self.checkpoint = Some(checkpoint);
    }
    /// Removes a terminally failed offset from the in-flight set without acknowledging it.
    fn fail(&mut self, offset: i64) {
        self.in_flight.remove(&offset);
    }
    /// Drops the window contents while keeping the checkpoint, which becomes the base of the
    /// next window.
    fn clear(&mut self) {
        self.base = self.checkpoint.or(self.base);
        self.in_flight.clear();
        self.acked.clear();
    }
}

/// Tracks in-flight offsets per source partition so that checkpointing can be decoupled from
/// flushing: the task commits each partition's safe offset, the highest contiguous acknowledged
/// offset plus one, without ever blocking on the producer in steady state.
///
/// The task loop submits through [`InFlightTracker::send`]; acknowledgements arrive on producer
/// threads and are folded in concurrently.
#[derive(Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<TrackerInner>,
}

/// Shared state between the tracker handle held by the task and the ack callbacks it hands to
/// the producer.
#[derive(Default)]
struct TrackerInner {
    /// Per-partition offset windows.
    windows: DashMap<SourcePartition, PartitionWindow>,
    /// Lowest terminally failed offset per partition since the last time failures were drained.
    failed: Mutex<HashMap<SourcePartition, i64>>,
}

impl TrackerInner {
    /// Folds a successful acknowledgement into the partition's window.
    fn on_ack(&self, partition: &SourcePartition, offset: i64) {
        if let Some(mut window) = self.windows.get_mut(partition) {
            window.ack(offset);
        }
    }
    /// Records a terminal delivery failure for later handling by the task loop.
    fn on_failure(&self, partition: &SourcePartition, offset: i64, error: &ProducerError) {
        warn!(
            "terminal delivery failure for {} at offset {}: {}",
            partition, offset, error
        );

        if let Some(mut window) = self.windows.get_mut(partition) {
            window.fail(offset);
        }

        let mut failed = self.failed.lock();

        failed
            .entry(partition.clone())
            .and_modify(|lowest| *lowest = (*lowest).min(offset))
            .or_insert(offset);
    }
}

impl InFlightTracker {
    /// Creates a new, empty [`InFlightTracker`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Submits a record to the producer and tracks its offset as in flight. The record's
    /// checkpoint token identifies the source position being tracked. If the producer refuses
    /// the record the offset is untracked again and the error is returned to the caller.
    pub fn send(
        &self,
        producer: &dyn ProducerHandle,
        record: ProducerRecord,
    ) -> Result<(), ProducerError> {
        let partition = record
            .checkpoint
            .source_partition()
            .unwrap_or_else(|| SourcePartition::new(record.topic.clone(), record.checkpoint.partition()));

        let offset = record.checkpoint.offset();

        self.inner
            .windows
            .entry(partition.clone())
            .or_default()
            .track(offset);

        let inner = Arc::clone(&self.inner);
        let ack_partition = partition.clone();

        let result = producer.send(
            record,
            Box::new(move |outcome| match outcome {
                Ok(()) => inner.on_ack(&ack_partition, offset),
                Err(e) => inner.on_failure(&ack_partition, offset, &e),
            }),
        );

        if result.is_err()
            && let Some(mut window) = self.inner.windows.get_mut(&partition)
        {
            window.fail(offset);
        }

        result
    }
    /// Returns the number of offsets currently in flight for the given partition.
    pub fn in_flight_count(&self, partition: &SourcePartition) -> usize {
        self.inner
            .windows
            .get(partition)
            .map(|w| w.in_flight.len())
            .unwrap_or(0)
    }
    /// Returns the safe offset for the given partition: the highest offset such that it and
    /// everything below it has been acknowledged.
    pub fn ack_checkpoint(&self, partition: &SourcePartition) -> Option<i64> {
        self.inner.windows.get(partition).and_then(|w| w.checkpoint)
    }
    /// Returns a snapshot of the in-flight counts of every tracked partition, for diagnostics.
    pub fn in_flight_message_counts(&self) -> HashMap<SourcePartition, usize> {
        self.inner
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().in_flight.len()))
            .collect()
    }
    /// Returns the offsets that are safe to commit, one per partition with an established
    /// checkpoint: the safe offset plus one.
    pub fn safe_commit_offsets(&self) -> HashMap<SourcePartition, i64> {
        self.inner
            .windows
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .checkpoint
                    .map(|cp| (entry.key().clone(), cp + 1))
            })
            .collect()
    }
    /// Drains the partitions that saw a terminal delivery failure since the last drain, keyed by
    /// the lowest failed offset.
    pub fn take_failures(&self) -> HashMap<SourcePartition, i64> {
        std::mem::take(&mut *self.inner.failed.lock())
    }
    /// Forgets all window state for a partition. Used when consumption is rewound after a send
    /// failure so the window can be rebuilt from the re-sent records.
    pub fn reset_partition(&self, partition: &SourcePartition) {
        self.inner.windows.remove(partition);
        self.inner.failed.lock().remove(partition);
    }
    /// Drops tracking state for partitions no longer assigned to the task.
    pub fn retain(&self, assigned: &HashSet<SourcePartition>) {
        self.inner.windows.retain(|p, _| assigned.contains(p));
        self.inner.failed.lock().retain(|p, _| assigned.contains(p));
    }
    /// Resets every window after a successful flush and commit. Each partition's checkpoint is
    /// kept and becomes the base of its next window.
    pub fn clear(&self) {
        for mut entry in self.inner.windows.iter_mut() {
            entry.value_mut().clear();
        }

        self.inner.failed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockProducer;
    use crate::{envelope::Envelope, partition::CheckpointToken};

    fn test_partition() -> SourcePartition {
        SourcePartition::new("A", 0)
    }

    fn record(offset: i64) -> ProducerRecord {
        ProducerRecord {
            envelope: Envelope {
                key: None,
                value: Some(vec![1u8]),
                headers: None,
                metadata: HashMap::new(),
            },
            destination: String::from("kafka://dest:9092/A"),
            topic: String::from("A"),
            checkpoint: CheckpointToken::mirror(&test_partition(), offset),
            partition: None,
            events_source_timestamp: 0,
        }
    }

    #[test]
    fn checkpoint_advances_only_to_contiguous_boundary() {
        let tracker = InFlightTracker::new();
        let producer = MockProducer::manual();
        let partition = test_partition();

        for offset in 0..10 {
            tracker.send(&producer, record(offset)).unwrap();
        }

        assert_eq!(tracker.in_flight_count(&partition), 10);
        assert_eq!(tracker.ack_checkpoint(&partition), None);

        // acks arrive in order 0, 1, 2, 4, 5: the gap at 3 holds the checkpoint at 2.
        for offset in [0, 1, 2, 4, 5] {
            producer.ack_offset(offset);
        }

        assert_eq!(tracker.ack_checkpoint(&partition), Some(2));
        assert_eq!(
            tracker.safe_commit_offsets().get(&partition).copied(),
            Some(3)
        );

        // ack 3 closes the gap and the checkpoint jumps to 5.
        producer.ack_offset(3);

        assert_eq!(tracker.ack_checkpoint(&partition), Some(5));

        for offset in 6..10 {
            producer.ack_offset(offset);
        }

        assert_eq!(tracker.ack_checkpoint(&partition), Some(9));
        assert_eq!(
            tracker.safe_commit_offsets().get(&partition).copied(),
            Some(10)
        );
        assert_eq!(tracker.in_flight_count(&partition), 0);
    }

    #[test]
    fn clear_keeps_the_checkpoint() {
        let tracker = InFlightTracker::new();
        let producer = MockProducer::manual();
        let partition = test_partition();

        for offset in 0..3 {
            tracker.send(&producer, record(offset)).unwrap();
            producer.ack_offset(offset);
        }

        assert_eq!(tracker.ack_checkpoint(&partition), Some(2));

        tracker.clear();

        assert_eq!(tracker.ack_checkpoint(&partition), Some(2));
        assert_eq!(tracker.in_flight_count(&partition), 0);

        // the next window builds on top of the kept checkpoint.
        tracker.send(&producer, record(3)).unwrap();
        producer.ack_offset(3);

        assert_eq!(tracker.ack_checkpoint(&partition), Some(3));
    }

    #[test]
    fn terminal_failures_are_reported_once() {
        let tracker = InFlightTracker::new();
        let producer = MockProducer::manual();
        let partition = test_partition();

        for offset in 0..5 {
            tracker.send(&producer, record(offset)).unwrap();
        }

        producer.ack_offset(0);
        producer.fail_offset(2, ProducerError::Rejected(String::from("boom")));
        producer.fail_offset(1, ProducerError::Rejected(String::from("boom")));

        let failures = tracker.take_failures();

        assert_eq!(failures.get(&partition).copied(), Some(1));
        assert!(tracker.take_failures().is_empty());

        // failed offsets leave the in-flight set but do not advance the checkpoint.
        assert_eq!(tracker.in_flight_count(&partition), 2);
        assert_eq!(tracker.ack_checkpoint(&partition), Some(0));
    }

    #[test]
    fn reset_partition_forgets_window_state() {
        let tracker = InFlightTracker::new();
        let producer = MockProducer::manual();
        let partition = test_partition();

        tracker.send(&producer, record(0)).unwrap();
        tracker.reset_partition(&partition);

        assert_eq!(tracker.in_flight_count(&partition), 0);
        assert_eq!(tracker.ack_checkpoint(&partition), None);
    }

    #[test]
    fn retain_prunes_unassigned_partitions() {
        let tracker = InFlightTracker::new();
        let producer = MockProducer::manual();

        tracker.send(&producer, record(0)).unwrap();

        tracker.retain(&HashSet::new());

        assert!(tracker.in_flight_message_counts().is_empty());
    }

    #[test]
    fn concurrent_acks_converge() {
        let tracker = InFlightTracker::new();
        let producer = MockProducer::manual();
        let partition = test_partition();

        for offset in 0..100 {
            tracker.send(&producer, record(offset)).unwrap();
        }

        let mut handles = Vec::new();

        for chunk in 0..4 {
            let producer = producer.clone();

            handles.push(std::thread::spawn(move || {
                for offset in (chunk..100).step_by(4) {
                    producer.ack_offset(offset);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.ack_checkpoint(&partition), Some(99));
        assert_eq!(tracker.in_flight_count(&partition), 0);
    }
}
