use crate::partition::SourcePartition;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Display,
    time::Instant,
};

/// Partition id value that selects every assigned partition of a topic in the operator-provided
/// pause configuration.
pub const WILDCARD_PARTITION: &str = "*";

/// Why a partition is paused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    /// Sends for the partition exhausted their retries.
    SendError,
    /// The partition exceeded the configured in-flight message threshold.
    ExceededMaxInFlight,
    /// The destination topic for the partition is not ready to accept records.
    TopicNotReady,
    /// The operator paused the partition through datastream metadata.
    Manual,
}

impl Display for PauseReason {
    /// Writes the wire representation of the reason to the [`std::fmt::Formatter`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SendError => "SEND_ERROR",
            Self::ExceededMaxInFlight => "EXCEEDED_MAX_IN_FLIGHT",
            Self::TopicNotReady => "TOPIC_NOT_READY",
            Self::Manual => "MANUAL",
        };

        f.write_str(s)
    }
}

/// Condition under which an auto-paused partition resumes. Evaluated against a
/// [`ReconcileContext`] on every reconcile pass.
#[derive(Clone, Copy, Debug)]
pub enum ResumeCondition {
    /// Resume once the monotonic clock passes the deadline.
    Deadline(Instant),
    /// Resume once the partition's in-flight message count is at or below the threshold.
    InFlightAtOrBelow(usize),
    /// Resume once the destination topic for the partition reports ready.
    TopicReady,
}

/// One auto-pause entry: why the partition was paused and when it may resume.
#[derive(Clone, Debug)]
pub struct PauseEntry {
    /// Why the partition was paused.
    pub reason: PauseReason,
    /// Condition under which the pause lifts.
    pub resume: ResumeCondition,
    /// Wall-clock time the entry was created, for diagnostics.
    pub since: DateTime<Utc>,
}

impl PauseEntry {
    /// Creates a new [`PauseEntry`] stamped with the current wall-clock time.
    pub fn new(reason: PauseReason, resume: ResumeCondition) -> Self {
        Self {
            reason,
            resume,
            since: Utc::now(),
        }
    }
}

/// Inputs consulted when evaluating resume conditions during a reconcile pass.
pub struct ReconcileContext<'a> {
    /// Current monotonic time.
    pub now: Instant,
    /// Returns the in-flight message count for a partition.
    pub in_flight: &'a dyn Fn(&SourcePartition) -> usize,
    /// Returns true when the destination topic for a partition is ready.
    pub topic_ready: &'a dyn Fn(&SourcePartition) -> bool,
}

impl ReconcileContext<'_> {
    /// Evaluates whether the given resume condition is satisfied.
    fn satisfied(&self, partition: &SourcePartition, condition: &ResumeCondition) -> bool {
        match condition {
            ResumeCondition::Deadline(deadline) => self.now >= *deadline,
            ResumeCondition::InFlightAtOrBelow(threshold) => {
                (self.in_flight)(partition) <= *threshold
            }
            ResumeCondition::TopicReady => (self.topic_ready)(partition),
        }
    }
}

/// The adapter calls required to make the actual paused set match the desired one.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct PauseDelta {
    /// Partitions that must be newly paused.
    pub to_pause: HashSet<SourcePartition>,
    /// Partitions that must be resumed.
    pub to_resume: HashSet<SourcePartition>,
}

impl PauseDelta {
    /// Returns true when no adapter calls are required.
    pub fn is_empty(&self) -> bool {
        self.to_pause.is_empty() && self.to_resume.is_empty()
    }
}

/// Maintains the union of operator-configured paused partitions and partitions the task paused
/// on its own. Pure state: the controller never talks to an adapter; the task loop applies the
/// [`PauseDelta`] computed by [`PauseController::reconcile`] immediately before its next poll.
#[derive(Debug, Default)]
pub struct PauseController {
    /// Operator-configured pauses: topic name to partition ids, where `"*"` selects every
    /// assigned partition of the topic.
    manual: HashMap<String, BTreeSet<String>>,
    /// Pauses applied by the task itself in response to runtime signals.
    auto: HashMap<SourcePartition, PauseEntry>,
}

impl PauseController {
    /// Creates a new [`PauseController`] with no paused partitions.
    pub fn new() -> Self {
        Self::default()
    }
    /// Replaces the operator-configured pause map. Returns true if the configuration changed.
    pub fn set_manual(&mut self, manual: HashMap<String, BTreeSet<String>>) -> bool {
        if self.manual == manual {
            return false;
        }

        self.manual = manual;

        true
    }
    /// Inserts or overwrites an auto-pause entry for the given partition.
    pub fn auto_pause(&mut self, partition: SourcePartition, entry: PauseEntry) {
        tracing::info!(
            "auto-pausing partition {} with reason {}",
            partition,
            entry.reason
        );

        self.auto.insert(partition, entry);
    }
    /// Returns true if the given partition currently has an auto-pause entry.
    pub fn is_auto_paused(&self, partition: &SourcePartition) -> bool {
        self.auto.contains_key(partition)
    }
    /// Drops auto-pause entries for partitions that are no longer assigned.
    pub fn prune(&mut self, assigned: &HashSet<SourcePartition>) {
        self.auto.retain(|p, _| assigned.contains(p));
    }
    /// Returns a snapshot of the auto-paused partitions for diagnostics.
    pub fn auto_paused(&self) -> HashMap<SourcePartition, PauseEntry> {
        self.auto.clone()
    }
    /// Returns a snapshot of the operator-configured pause map for diagnostics.
    pub fn manual_paused(&self) -> HashMap<String, BTreeSet<String>> {
        self.manual.clone()
    }
    /// Computes the desired paused set as the union of the manual and auto pauses restricted to
    /// the currently assigned partitions, and returns the delta against the currently paused
    /// set. Auto entries whose resume condition is satisfied, entries for unassigned partitions
    /// and auto entries shadowed by a manual pause are dropped.
    ///
    /// A manual wildcard is expanded against the partitions assigned right now; partitions of
    /// the topic that appear after this pass are not paused until the next one.
    pub fn reconcile(
        &mut self,
        assigned: &HashSet<SourcePartition>,
        currently_paused: &HashSet<SourcePartition>,
        ctx: &ReconcileContext<'_>,
    ) -> PauseDelta {
        self.auto.retain(|partition, entry| {
            if !assigned.contains(partition) {
                return false;
            }

            if ctx.satisfied(partition, &entry.resume) {
                tracing::info!(
                    "resume condition met for partition {} paused with reason {}",
                    partition,
                    entry.reason
                );
                return false;
            }

            true
        });

        let manual = self.expand_manual(assigned);

        // manual wins: an operator pause replaces any auto entry for the same partition.
        self.auto.retain(|partition, _| !manual.contains(partition));

        let mut desired = manual;
        desired.extend(self.auto.keys().cloned());

        let actual: HashSet<SourcePartition> = currently_paused
            .intersection(assigned)
            .cloned()
            .collect();

        PauseDelta {
            to_pause: desired.difference(&actual).cloned().collect(),
            to_resume: actual.difference(&desired).cloned().collect(),
        }
    }

    /// Expands the operator-configured pause map against the assigned partitions, inflating
    /// wildcards and dropping entries that do not match an assigned partition.
    fn expand_manual(&self, assigned: &HashSet<SourcePartition>) -> HashSet<SourcePartition> {
        let mut expanded = HashSet::new();

        for (topic, partitions) in &self.manual {
            if partitions.contains(WILDCARD_PARTITION) {
                expanded.extend(assigned.iter().filter(|p| p.topic() == topic).cloned());
                continue;
            }

            for id in partitions {
                match id.parse::<i32>() {
                    Ok(number) => {
                        let partition = SourcePartition::new(topic.clone(), number);

                        if assigned.contains(&partition) {
                            expanded.insert(partition);
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            "ignoring unparseable paused partition id {} for topic {}",
                            id,
                            topic
                        );
                    }
                }
            }
        }

        expanded
    }
}
