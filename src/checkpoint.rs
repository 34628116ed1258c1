use crate::{partition::SourcePartition, tracker::InFlightTracker};

use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

/// How forcefully a commit flushes outstanding state. Soft commits run on the commit interval
/// and never block on the producer in flushless mode; hard commits flush first so that every
/// in-flight record is covered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitKind {
    /// Periodic commit driven by the commit interval.
    Soft,
    /// Forced commit: partition revocation, task shutdown, or snapshot consistency.
    Hard,
}

/// Progress record a task keeps per assigned partition, exposed through the position
/// diagnostics endpoint.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionPosition {
    /// Offset of the last record polled from the partition.
    pub last_polled_offset: Option<i64>,
    /// Offset last committed to the source for the partition.
    pub committed_offset: Option<i64>,
    /// Event timestamp of the last polled record, epoch milliseconds.
    pub event_timestamp: Option<i64>,
}

/// Decides when the task commits and which offsets it commits: the tracker's safe offsets in
/// flushless mode, the polled positions after a successful flush otherwise.
#[derive(Clone, Copy, Debug)]
pub struct CheckpointPolicy {
    /// Period between soft commits.
    interval: Duration,
    /// Whether commits rely on the in-flight tracker instead of flushing.
    flushless: bool,
}

impl CheckpointPolicy {
    /// Creates a new [`CheckpointPolicy`].
    pub fn new(interval: Duration, flushless: bool) -> Self {
        Self { interval, flushless }
    }
    /// Returns true when the commit interval has elapsed since the last commit.
    pub fn due(&self, last_commit: Instant, now: Instant) -> bool {
        now.duration_since(last_commit) >= self.interval
    }
    /// Returns true when commits rely on the tracker's safe offsets.
    pub fn flushless(&self) -> bool {
        self.flushless
    }
    /// Assembles the offsets to commit in flushful mode: for every assigned partition with a
    /// polled position, the offset after the last polled record. Only valid after a successful
    /// flush.
    pub fn flushful_offsets(
        positions: &HashMap<SourcePartition, PartitionPosition>,
        assigned: &HashSet<SourcePartition>,
    ) -> HashMap<SourcePartition, i64> {
        positions
            .iter()
            .filter(|(partition, _)| assigned.contains(partition))
            .filter_map(|(partition, position)| {
                position
                    .last_polled_offset
                    .map(|offset| (partition.clone(), offset + 1))
            })
            .collect()
    }
    /// Assembles the offsets to commit in flushless mode: each assigned partition's safe offset
    /// plus one, as tracked by the in-flight tracker.
    pub fn flushless_offsets(
        tracker: &InFlightTracker,
        assigned: &HashSet<SourcePartition>,
    ) -> HashMap<SourcePartition, i64> {
        tracker
            .safe_commit_offsets()
            .into_iter()
            .filter(|(partition, _)| assigned.contains(partition))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_respects_the_interval() {
        let policy = CheckpointPolicy::new(Duration::from_secs(60), false);
        let start = Instant::now();

        assert!(!policy.due(start, start + Duration::from_secs(59)));
        assert!(policy.due(start, start + Duration::from_secs(60)));
    }

    #[test]
    fn flushful_offsets_commit_past_the_last_polled_record() {
        let a0 = SourcePartition::new("A", 0);
        let b0 = SourcePartition::new("B", 0);

        let mut positions = HashMap::new();
        positions.insert(
            a0.clone(),
            PartitionPosition {
                last_polled_offset: Some(9),
                committed_offset: Some(5),
                event_timestamp: None,
            },
        );
        positions.insert(b0.clone(), PartitionPosition::default());

        let assigned = [a0.clone(), b0].into_iter().collect();

        let offsets = CheckpointPolicy::flushful_offsets(&positions, &assigned);

        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets.get(&a0).copied(), Some(10));
    }

    #[test]
    fn flushful_offsets_skip_unassigned_partitions() {
        let a0 = SourcePartition::new("A", 0);

        let mut positions = HashMap::new();
        positions.insert(
            a0,
            PartitionPosition {
                last_polled_offset: Some(3),
                committed_offset: None,
                event_timestamp: None,
            },
        );

        let offsets = CheckpointPolicy::flushful_offsets(&positions, &HashSet::new());

        assert!(offsets.is_empty());
    }
}
