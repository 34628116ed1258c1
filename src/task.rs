use crate::{
    checkpoint::{CheckpointPolicy, CommitKind, PartitionPosition},
    config::{ResetPolicy, TaskConfig},
    connector::{TaskConnector, TopicReadiness},
    datastream::Datastream,
    envelope::{RecordTranslator, SourceRecord},
    partition::SourcePartition,
    pause::{PauseController, PauseEntry, PauseReason, ReconcileContext, ResumeCondition},
    producer::ProducerHandle,
    source::{
        AdapterSession, AssignmentListener, RecordBatch, SourceAdapter, SourceError,
    },
    tracker::InFlightTracker,
    util,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;

/// Maximum time a producer flush may block during a hard commit or shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle states of a datastream task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// The task is opening its producer and source adapter.
    Starting,
    /// The task is polling and forwarding records.
    Running,
    /// A stop was requested and the task is winding down.
    Stopping,
    /// The task has released its resources after a clean stop.
    Stopped,
    /// The task exited because of a fatal failure. The supervisor may recreate it.
    Error,
}

impl TaskState {
    /// Packs the state into its atomic cell representation.
    fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
            Self::Error => 4,
        }
    }
    /// Unpacks the state from its atomic cell representation.
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Error,
        }
    }
}

/// Identity of a task: the connector it runs under and the datastream it executes. The
/// supervisor may run several generations of task for the same identity over time.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TaskId {
    /// Name of the connector.
    connector: String,
    /// Name of the datastream.
    datastream: String,
}

impl TaskId {
    /// Creates a new [`TaskId`].
    pub fn new(connector: impl Into<String>, datastream: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            datastream: datastream.into(),
        }
    }
    /// Returns the connector name.
    pub fn connector(&self) -> &str {
        &self.connector
    }
    /// Returns the datastream name.
    pub fn datastream(&self) -> &str {
        &self.datastream
    }
}

impl Display for TaskId {
    /// Writes the `{connector}:{datastream}` representation to the [`std::fmt::Formatter`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.connector, self.datastream))
    }
}

/// Control messages pushed onto a task's internal queue. Producers are the supervisor, the
/// assignment listener and the flow-control path of the loop itself; the loop is the only
/// consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskUpdate {
    /// The pause configuration or the assignment changed; reconcile before the next poll.
    PauseResumePartitions,
}

/// Errors that terminate a task's loop.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Stop was requested; the task winds down cleanly.
    #[error("stop requested")]
    StopRequested,
    /// An unrecoverable failure; the task exits with an error status and the supervisor may
    /// recreate it.
    #[error("fatal task failure: {0}")]
    Fatal(String),
}

/// State a task shares with its assignment listener, the supervisor and the diagnostics
/// endpoints. Everything here is either immutable, atomic or behind a short-held lock.
pub struct TaskShared {
    /// Identity of the task.
    id: TaskId,
    /// Snapshot of the datastream definition. Swapped wholesale by the supervisor on update.
    datastream: RwLock<Arc<Datastream>>,
    /// Current lifecycle state.
    state: AtomicU8,
    /// Set once stop has been requested.
    stop_requested: AtomicBool,
    /// Epoch milliseconds of the last completed poll. Read by the supervisor for liveness.
    last_polled_ms: AtomicI64,
    /// Sender side of the task update queue.
    updates_tx: Sender<TaskUpdate>,
    /// Receiver side of the task update queue, drained only by the loop.
    updates_rx: Receiver<TaskUpdate>,
    /// Signals an in-progress retry sleep to abort.
    stop_tx: Sender<()>,
    /// Receiver the loop sleeps on so stop interrupts the sleep.
    stop_rx: Receiver<()>,
    /// The source adapter, installed during startup. Held here so stop can wake the poll.
    adapter: RwLock<Option<Arc<dyn SourceAdapter>>>,
    /// The producer handle, installed during startup. Held here so revoke callbacks can flush.
    producer: RwLock<Option<Arc<dyn ProducerHandle>>>,
    /// Pause state for the task's partitions.
    pause: Mutex<PauseController>,
    /// In-flight offset windows per partition.
    tracker: InFlightTracker,
    /// Progress per assigned partition.
    positions: Mutex<HashMap<SourcePartition, PartitionPosition>>,
    /// Partitions currently assigned to the task.
    assigned: RwLock<HashSet<SourcePartition>>,
}

impl TaskShared {
    /// Returns the identity of the task.
    pub fn id(&self) -> &TaskId {
        &self.id
    }
    /// Returns the current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }
    /// Stores a new lifecycle state.
    fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
    /// Returns true once stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
    /// Requests a cooperative stop: flags the loop, interrupts any retry sleep and wakes the
    /// adapter out of its poll. Idempotent.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);

        if matches!(self.state(), TaskState::Starting | TaskState::Running) {
            self.set_state(TaskState::Stopping);
        }

        let _ = self.stop_tx.try_send(());

        if let Some(adapter) = self.adapter.read().clone() {
            adapter.wakeup();
        }
    }
    /// Pushes an update onto the task's queue.
    pub fn enqueue_update(&self, update: TaskUpdate) {
        if self.updates_tx.send(update).is_err() {
            tracing::warn!("task {} update queue is disconnected", self.id);
        }
    }
    /// Records the completion of a poll for supervisor liveness checks.
    fn record_poll_time(&self) {
        self.last_polled_ms.store(util::epoch_millis(), Ordering::SeqCst);
    }
    /// Returns the epoch milliseconds of the last completed poll.
    pub fn last_polled_ms(&self) -> i64 {
        self.last_polled_ms.load(Ordering::SeqCst)
    }
    /// Returns the current datastream snapshot.
    pub fn datastream(&self) -> Arc<Datastream> {
        self.datastream.read().clone()
    }
    /// Returns the partitions currently assigned to the task.
    pub fn assignment_snapshot(&self) -> HashSet<SourcePartition> {
        self.assigned.read().clone()
    }
    /// Returns the per-partition progress of the task.
    pub fn positions_snapshot(&self) -> HashMap<SourcePartition, PartitionPosition> {
        self.positions.lock().clone()
    }
    /// Returns the auto-paused partitions of the task.
    pub fn auto_paused_snapshot(&self) -> HashMap<SourcePartition, PauseEntry> {
        self.pause.lock().auto_paused()
    }
    /// Returns the operator-configured pause map of the task.
    pub fn manual_paused_snapshot(&self) -> HashMap<String, BTreeSet<String>> {
        self.pause.lock().manual_paused()
    }
    /// Returns the in-flight message counts per partition.
    pub fn in_flight_counts(&self) -> HashMap<SourcePartition, usize> {
        self.tracker.in_flight_message_counts()
    }
    /// Assembles the offsets a commit should persist right now, per the checkpoint policy.
    fn commit_map(&self, policy: &CheckpointPolicy) -> HashMap<SourcePartition, i64> {
        let assigned = self.assigned.read().clone();

        if policy.flushless() {
            CheckpointPolicy::flushless_offsets(&self.tracker, &assigned)
        } else {
            CheckpointPolicy::flushful_offsets(&self.positions.lock(), &assigned)
        }
    }
    /// Records offsets as committed in the per-partition progress.
    fn mark_committed(&self, offsets: &HashMap<SourcePartition, i64>) {
        let mut positions = self.positions.lock();

        for (partition, offset) in offsets {
            positions.entry(partition.clone()).or_default().committed_offset = Some(*offset);
        }
    }
}

/// Assignment listener wired into the source adapter at subscribe time. Runs on the task loop
/// thread, from within `poll`.
struct TaskAssignmentListener {
    /// State shared with the task.
    shared: Arc<TaskShared>,
    /// Destination readiness hook consulted on assignment.
    readiness: Arc<dyn TopicReadiness>,
    /// The task's checkpoint policy, used for revoke-time commits.
    policy: CheckpointPolicy,
}

impl AssignmentListener for TaskAssignmentListener {
    /// Records the new partitions, pauses any whose destination is not ready before the adapter
    /// can deliver their records, and schedules a pause reconciliation.
    fn on_assigned(&self, session: &dyn AdapterSession, partitions: &[SourcePartition]) {
        metrics::counter!("kafmirror_task_rebalances_total", "task" => self.shared.id.to_string())
            .increment(1);

        self.shared
            .assigned
            .write()
            .extend(partitions.iter().cloned());

        self.shared.enqueue_update(TaskUpdate::PauseResumePartitions);

        let unready = self.readiness.unready_partitions(partitions);

        if unready.is_empty() {
            return;
        }

        {
            let mut pause = self.shared.pause.lock();

            for partition in &unready {
                pause.auto_pause(
                    partition.clone(),
                    PauseEntry::new(PauseReason::TopicNotReady, ResumeCondition::TopicReady),
                );
            }
        }

        // this must happen before the callback returns: the adapter may otherwise deliver
        // records for these partitions in the very same poll.
        if let Err(e) = session.pause(&unready) {
            tracing::error!(
                "failed to pause partitions awaiting destination readiness: {}",
                e
            );
        }
    }
    /// Commits progress for the partitions while they are still owned, prunes task state down
    /// to the remaining assignment and schedules a pause reconciliation.
    fn on_revoked(&self, session: &dyn AdapterSession, partitions: &[SourcePartition]) {
        if !self.shared.stop_requested() {
            let flushed = match self.shared.producer.read().clone() {
                Some(producer) => match producer.flush(FLUSH_TIMEOUT) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("flush during revocation failed: {}", e);
                        false
                    }
                },
                None => false,
            };

            // safe offsets are committable even without a flush; polled positions are not.
            let can_commit = self.policy.flushless() || flushed;

            if can_commit {
                let offsets = self.shared.commit_map(&self.policy);

                if !offsets.is_empty() {
                    match session.commit_sync(&offsets) {
                        Ok(()) => {
                            self.shared.mark_committed(&offsets);

                            if flushed {
                                self.shared.tracker.clear();
                            }
                        }
                        Err(e) => tracing::warn!("commit during revocation failed: {}", e),
                    }
                }
            }
        }

        let remaining = {
            let mut assigned = self.shared.assigned.write();

            for partition in partitions {
                assigned.remove(partition);
            }

            assigned.clone()
        };

        self.shared.pause.lock().prune(&remaining);
        self.shared.tracker.retain(&remaining);

        {
            let mut positions = self.shared.positions.lock();
            positions.retain(|p, _| remaining.contains(p));
        }

        self.shared.enqueue_update(TaskUpdate::PauseResumePartitions);
    }
}

/// Supervisor-side handle to a running task.
pub struct TaskHandle {
    /// State shared with the task.
    shared: Arc<TaskShared>,
    /// Receives the one-shot started signal.
    started_rx: Receiver<()>,
    /// Receives the one-shot stopped signal.
    stopped_rx: Receiver<()>,
}

impl TaskHandle {
    /// Returns the state shared with the task.
    pub fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }
    /// Requests a cooperative stop of the task. Idempotent.
    pub fn stop(&self) {
        self.shared.request_stop();
    }
    /// Waits up to `timeout` for the task to signal that its startup completed.
    pub fn await_started(&self, timeout: Duration) -> bool {
        self.started_rx.recv_timeout(timeout).is_ok()
    }
    /// Waits up to `timeout` for the task to signal that it has stopped.
    pub fn await_stopped(&self, timeout: Duration) -> bool {
        self.stopped_rx.recv_timeout(timeout).is_ok()
    }
    /// Swaps in a fresh datastream snapshot. Schedules a pause reconciliation only when the
    /// operator pause configuration actually changed; an invalid pause configuration is
    /// rejected and the previous state kept.
    pub fn update_datastream(&self, datastream: Datastream) {
        let previous = self.shared.datastream.read().clone();

        let next = Arc::new(datastream);
        *self.shared.datastream.write() = next.clone();

        let previous_paused = previous.paused_source_partitions().unwrap_or_default();

        match next.paused_source_partitions() {
            Ok(paused) => {
                if paused != previous_paused
                    && self.shared.pause.lock().set_manual(paused)
                {
                    tracing::info!(
                        "pause configuration changed for task {}, scheduling reconciliation",
                        self.shared.id
                    );

                    self.shared.enqueue_update(TaskUpdate::PauseResumePartitions);
                }
            }
            Err(e) => {
                tracing::error!(
                    "rejecting pause configuration update for task {}: {}",
                    self.shared.id,
                    e
                );
            }
        }
    }
}

/// A single datastream task: the cooperative loop that subscribes a source adapter, translates
/// records into envelopes, forwards them to a producer with delivery tracking, enforces
/// backpressure via auto-pause, and commits progress per the checkpoint policy.
pub struct DatastreamTask {
    /// State shared with the listener, supervisor and diagnostics.
    shared: Arc<TaskShared>,
    /// Builds the task's adapter, producer and readiness hook.
    connector: Arc<dyn TaskConnector>,
    /// Task-level configuration.
    config: TaskConfig,
    /// Checkpoint policy derived from the configuration.
    policy: CheckpointPolicy,
    /// One-shot started signal to the supervisor.
    started_tx: Sender<()>,
    /// One-shot stopped signal to the supervisor.
    stopped_tx: Sender<()>,
}

impl DatastreamTask {
    /// Creates a new task for the given datastream and its supervisor-side handle.
    pub fn new(
        datastream: Datastream,
        config: TaskConfig,
        connector: Arc<dyn TaskConnector>,
    ) -> (Self, TaskHandle) {
        let id = TaskId::new(connector.name(), datastream.name.clone());

        let (updates_tx, updates_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let (started_tx, started_rx) = bounded(1);
        let (stopped_tx, stopped_rx) = bounded(1);

        let shared = Arc::new(TaskShared {
            id,
            datastream: RwLock::new(Arc::new(datastream)),
            state: AtomicU8::new(TaskState::Starting.as_u8()),
            stop_requested: AtomicBool::new(false),
            last_polled_ms: AtomicI64::new(0),
            updates_tx,
            updates_rx,
            stop_tx,
            stop_rx,
            adapter: RwLock::new(None),
            producer: RwLock::new(None),
            pause: Mutex::new(PauseController::new()),
            tracker: InFlightTracker::new(),
            positions: Mutex::new(HashMap::new()),
            assigned: RwLock::new(HashSet::new()),
        });

        let policy = CheckpointPolicy::new(config.offset_commit_interval, config.flushless_mode);

        let task = Self {
            shared: Arc::clone(&shared),
            connector,
            config,
            policy,
            started_tx,
            stopped_tx,
        };

        let handle = TaskHandle {
            shared,
            started_rx,
            stopped_rx,
        };

        (task, handle)
    }

    /// Thread entry point. Runs the task until stop is requested, the adapter is closed, or a
    /// fatal failure occurs, then releases resources and signals the supervisor.
    pub fn run(self) {
        tracing::info!("task {} starting", self.shared.id);

        let error = match self.execute() {
            Ok(()) | Err(TaskError::StopRequested) => false,
            Err(e) => {
                tracing::error!("task {} failed: {}", self.shared.id, e);
                true
            }
        };

        self.shutdown(error);
    }

    /// Startup and main loop.
    fn execute(&self) -> Result<(), TaskError> {
        let datastream = self.shared.datastream();

        match datastream.paused_source_partitions() {
            Ok(paused) => {
                self.shared.pause.lock().set_manual(paused);
            }
            Err(e) => {
                tracing::error!(
                    "ignoring invalid pause configuration for task {}: {}",
                    self.shared.id,
                    e
                );
            }
        }

        let start_positions = datastream.start_positions().unwrap_or_default();

        let translator =
            RecordTranslator::new(&datastream).map_err(|e| TaskError::Fatal(e.to_string()))?;

        let producer = self
            .connector
            .producer_handle(&datastream)
            .map_err(|e| TaskError::Fatal(format!("open producer: {}", e)))?;

        let adapter = self
            .connector
            .source_adapter(&datastream)
            .map_err(|e| TaskError::Fatal(format!("open source adapter: {}", e)))?;

        *self.shared.producer.write() = Some(Arc::clone(&producer));
        *self.shared.adapter.write() = Some(Arc::clone(&adapter));

        let readiness = self.connector.topic_readiness();

        let listener = Arc::new(TaskAssignmentListener {
            shared: Arc::clone(&self.shared),
            readiness: Arc::clone(&readiness),
            policy: self.policy,
        });

        let subscription = self
            .connector
            .subscription(&datastream)
            .map_err(|e| TaskError::Fatal(format!("resolve subscription: {}", e)))?;

        adapter
            .subscribe(&subscription, listener)
            .map_err(|e| TaskError::Fatal(format!("subscribe: {}", e)))?;

        self.shared.set_state(TaskState::Running);
        self.shared.record_poll_time();
        let _ = self.started_tx.try_send(());

        tracing::info!("task {} started", self.shared.id);

        let poll_timeout = self.config.poll_timeout();
        let mut last_commit = Instant::now();

        while !self.shared.stop_requested() {
            self.drain_task_updates(&*adapter, &*readiness);
            self.handle_send_failures(&*adapter, &start_positions);

            let poll_started = Instant::now();

            let batch = match adapter.poll(poll_timeout) {
                Ok(batch) => batch,
                Err(e) => {
                    self.handle_poll_error(e, &*adapter, &start_positions)?;
                    RecordBatch::new()
                }
            };

            self.shared.record_poll_time();

            let poll_elapsed = poll_started.elapsed();

            if poll_elapsed > poll_timeout + Duration::from_secs(1) {
                tracing::warn!(
                    "poll on task {} took {:?}, exceeding its {:?} timeout",
                    self.shared.id,
                    poll_elapsed,
                    poll_timeout
                );

                metrics::counter!(
                    "kafmirror_task_poll_overrun_total",
                    "task" => self.shared.id.to_string()
                )
                .increment(1);
            }

            if batch.is_empty() {
                continue;
            }

            let read_time = Utc::now();
            let read_instant = Instant::now();

            self.translate_and_send(
                &batch,
                read_time,
                &translator,
                &*producer,
                &*adapter,
                &start_positions,
            )?;

            let processing = read_instant.elapsed();

            metrics::histogram!(
                "kafmirror_task_processing_delay_ms",
                "task" => self.shared.id.to_string()
            )
            .record(processing.as_millis() as f64);

            if processing > self.config.processing_delay_threshold {
                tracing::warn!(
                    "task {} took {:?} to process a batch of {} records",
                    self.shared.id,
                    processing,
                    batch.len()
                );
            }

            if self.policy.due(last_commit, Instant::now()) {
                self.commit(CommitKind::Soft, &*adapter, &*producer);
                last_commit = Instant::now();
            }
        }

        Ok(())
    }

    /// Drains the task update queue and reconciles pause state when anything requested it.
    fn drain_task_updates(&self, adapter: &dyn SourceAdapter, readiness: &dyn TopicReadiness) {
        let mut reconcile = false;

        while let Ok(update) = self.shared.updates_rx.try_recv() {
            match update {
                TaskUpdate::PauseResumePartitions => reconcile = true,
            }
        }

        if reconcile {
            self.reconcile_pauses(adapter, readiness);
        }
    }

    /// Computes the desired paused set and applies the delta to the adapter.
    fn reconcile_pauses(&self, adapter: &dyn SourceAdapter, readiness: &dyn TopicReadiness) {
        let assigned = match adapter.assignment() {
            Ok(assigned) => assigned,
            Err(e) => {
                tracing::warn!("failed to fetch assignment for pause reconcile: {}", e);
                return;
            }
        };

        *self.shared.assigned.write() = assigned.clone();

        let currently_paused = adapter.paused().unwrap_or_default();

        let tracker = &self.shared.tracker;
        let in_flight = |p: &SourcePartition| tracker.in_flight_count(p);
        let topic_ready = |p: &SourcePartition| readiness.is_ready(p);

        let delta = self.shared.pause.lock().reconcile(
            &assigned,
            &currently_paused,
            &ReconcileContext {
                now: Instant::now(),
                in_flight: &in_flight,
                topic_ready: &topic_ready,
            },
        );

        if !delta.to_pause.is_empty() {
            match adapter.pause(&delta.to_pause) {
                Ok(()) => tracing::info!("paused partitions {:?}", delta.to_pause),
                Err(e) => tracing::warn!("failed to pause partitions: {}", e),
            }
        }

        if !delta.to_resume.is_empty() {
            match adapter.resume(&delta.to_resume) {
                Ok(()) => tracing::info!("resumed partitions {:?}", delta.to_resume),
                Err(e) => tracing::warn!("failed to resume partitions: {}", e),
            }
        }

        metrics::gauge!(
            "kafmirror_task_auto_paused_partitions",
            "task" => self.shared.id.to_string()
        )
        .set(self.shared.pause.lock().auto_paused().len() as f64);
    }

    /// Applies send-failure recovery for partitions whose deliveries failed terminally since
    /// the last loop iteration.
    fn handle_send_failures(
        &self,
        adapter: &dyn SourceAdapter,
        start_positions: &HashMap<i32, i64>,
    ) {
        for (partition, offset) in self.shared.tracker.take_failures() {
            if !self.shared.assigned.read().contains(&partition) {
                continue;
            }

            tracing::warn!(
                "delivery for {} failed terminally at offset {}, rewinding",
                partition,
                offset
            );

            self.recover_partition(&partition, adapter, start_positions);
        }
    }

    /// Translates and sends one polled batch, partition by partition. A failing partition is
    /// recovered and skipped without affecting the others.
    fn translate_and_send(
        &self,
        batch: &RecordBatch,
        read_time: DateTime<Utc>,
        translator: &RecordTranslator,
        producer: &dyn ProducerHandle,
        adapter: &dyn SourceAdapter,
        start_positions: &HashMap<i32, i64>,
    ) -> Result<(), TaskError> {
        for (partition, records) in batch.iter() {
            self.send_partition(
                partition,
                records,
                read_time,
                translator,
                producer,
                adapter,
                start_positions,
            )?;
        }

        Ok(())
    }

    /// Sends one partition's records in offset order. A record that exhausts its retries
    /// triggers recovery for the partition and the rest of its records are dropped; they will
    /// be re-polled after the seek-back.
    #[allow(clippy::too_many_arguments)]
    fn send_partition(
        &self,
        partition: &SourcePartition,
        records: &[SourceRecord],
        read_time: DateTime<Utc>,
        translator: &RecordTranslator,
        producer: &dyn ProducerHandle,
        adapter: &dyn SourceAdapter,
        start_positions: &HashMap<i32, i64>,
    ) -> Result<(), TaskError> {
        for record in records {
            let translated = translator.translate(record, read_time);
            let mut attempt = 0u32;

            loop {
                if self.shared.stop_requested() {
                    return Err(TaskError::StopRequested);
                }

                match self.shared.tracker.send(producer, translated.clone()) {
                    Ok(()) => {
                        {
                            let mut positions = self.shared.positions.lock();
                            let position = positions.entry(partition.clone()).or_default();
                            position.last_polled_offset = Some(record.offset);
                            position.event_timestamp = Some(translated.events_source_timestamp);
                        }

                        metrics::counter!(
                            "kafmirror_task_events_processed_total",
                            "task" => self.shared.id.to_string()
                        )
                        .increment(1);

                        self.maybe_flow_control(partition);

                        break;
                    }
                    Err(e) => {
                        attempt += 1;

                        if attempt >= self.config.max_retry_count {
                            tracing::error!(
                                "giving up on {} at offset {} after {} attempts: {}",
                                partition,
                                record.offset,
                                attempt,
                                e
                            );

                            self.recover_partition(partition, adapter, start_positions);

                            return Ok(());
                        }

                        tracing::warn!(
                            "send attempt {} for {} at offset {} failed: {}",
                            attempt,
                            partition,
                            record.offset,
                            e
                        );

                        self.sleep_interruptibly(self.config.retry_sleep)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Auto-pauses the partition when flow control is enabled and its in-flight count exceeds
    /// the configured threshold.
    fn maybe_flow_control(&self, partition: &SourcePartition) {
        if !self.config.flow_control_enabled || !self.policy.flushless() {
            return;
        }

        let in_flight = self.shared.tracker.in_flight_count(partition);

        if in_flight <= self.config.max_in_flight_messages_threshold {
            return;
        }

        let mut pause = self.shared.pause.lock();

        if pause.is_auto_paused(partition) {
            return;
        }

        tracing::info!(
            "partition {} has {} messages in flight, applying flow control",
            partition,
            in_flight
        );

        pause.auto_pause(
            partition.clone(),
            PauseEntry::new(
                PauseReason::ExceededMaxInFlight,
                ResumeCondition::InFlightAtOrBelow(self.config.min_in_flight_messages_threshold),
            ),
        );

        drop(pause);

        self.shared.enqueue_update(TaskUpdate::PauseResumePartitions);
    }

    /// Rewinds a partition after a terminal send failure: seek back to the last committed
    /// offset, the configured start position, or the reset policy default; drop its window; and
    /// optionally auto-pause it for the configured error duration.
    fn recover_partition(
        &self,
        partition: &SourcePartition,
        adapter: &dyn SourceAdapter,
        start_positions: &HashMap<i32, i64>,
    ) {
        metrics::counter!(
            "kafmirror_task_errors_total",
            "task" => self.shared.id.to_string()
        )
        .increment(1);

        let committed = self
            .shared
            .positions
            .lock()
            .get(partition)
            .and_then(|p| p.committed_offset);

        let committed = match committed {
            Some(offset) => Some(offset),
            None => adapter.committed(partition).unwrap_or_default(),
        };

        let target = committed.or_else(|| start_positions.get(&partition.partition()).copied());

        let seek_result = match target {
            Some(offset) => adapter.seek(partition, offset),
            None => {
                let single = HashSet::from([partition.clone()]);

                match self.config.reset_policy {
                    ResetPolicy::Earliest => adapter.seek_to_beginning(&single),
                    ResetPolicy::Latest => adapter.seek_to_end(&single),
                }
            }
        };

        if let Err(e) = seek_result {
            tracing::error!("failed to rewind {} after send failure: {}", partition, e);
        }

        self.shared.tracker.reset_partition(partition);

        if self.config.pause_partition_on_error {
            self.shared.pause.lock().auto_pause(
                partition.clone(),
                PauseEntry::new(
                    PauseReason::SendError,
                    ResumeCondition::Deadline(Instant::now() + self.config.pause_error_duration),
                ),
            );

            self.shared.enqueue_update(TaskUpdate::PauseResumePartitions);
        }
    }

    /// Applies the poll error table: seek on missing offsets, delegate out-of-range handling to
    /// the adapter, swallow wakeups, treat a closed adapter as fatal, and back off on anything
    /// else.
    fn handle_poll_error(
        &self,
        error: SourceError,
        adapter: &dyn SourceAdapter,
        start_positions: &HashMap<i32, i64>,
    ) -> Result<(), TaskError> {
        match error {
            SourceError::NoOffsetForPartitions(partitions) => {
                tracing::info!(
                    "no committed offsets for {:?}, applying start positions",
                    partitions
                );

                for partition in partitions {
                    let result = match start_positions.get(&partition.partition()) {
                        Some(offset) => adapter.seek(&partition, *offset),
                        None => {
                            let single = HashSet::from([partition.clone()]);

                            match self.config.reset_policy {
                                ResetPolicy::Earliest => adapter.seek_to_beginning(&single),
                                ResetPolicy::Latest => adapter.seek_to_end(&single),
                            }
                        }
                    };

                    if let Err(e) = result {
                        tracing::warn!("failed to apply start position for {}: {}", partition, e);
                    }
                }

                Ok(())
            }
            SourceError::OffsetOutOfRange(offsets) => {
                adapter.handle_offset_out_of_range(&offsets);
                Ok(())
            }
            SourceError::WakeupTriggered => Ok(()),
            SourceError::Closed => Err(TaskError::Fatal(String::from(
                "source adapter closed unexpectedly",
            ))),
            SourceError::Transient(message) => {
                tracing::warn!("transient poll failure: {}", message);

                metrics::counter!(
                    "kafmirror_task_errors_total",
                    "task" => self.shared.id.to_string()
                )
                .increment(1);

                self.sleep_interruptibly(self.config.retry_sleep)?;

                Ok(())
            }
        }
    }

    /// Commits progress per the checkpoint policy. Soft commits in flushless mode never block
    /// on the producer; hard commits flush first so the safe offsets cover everything that was
    /// in flight, then reset the tracker.
    fn commit(&self, kind: CommitKind, adapter: &dyn SourceAdapter, producer: &dyn ProducerHandle) {
        let flushed = if self.policy.flushless() {
            if kind == CommitKind::Hard {
                match producer.flush(FLUSH_TIMEOUT) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("flush before hard commit failed: {}", e);
                        false
                    }
                }
            } else {
                false
            }
        } else {
            match producer.flush(FLUSH_TIMEOUT) {
                Ok(()) => true,
                Err(e) => {
                    // polled positions are only committable once everything is acknowledged.
                    tracing::warn!("flush failed, skipping commit: {}", e);
                    return;
                }
            }
        };

        let offsets = self.shared.commit_map(&self.policy);

        if offsets.is_empty() {
            if self.policy.flushless() && kind == CommitKind::Hard && flushed {
                self.shared.tracker.clear();
            }

            return;
        }

        match adapter.commit_sync(Some(&offsets)) {
            Ok(()) => {
                self.shared.mark_committed(&offsets);

                if self.policy.flushless() {
                    if kind == CommitKind::Hard && flushed {
                        self.shared.tracker.clear();
                    }
                } else {
                    self.shared.tracker.clear();
                }

                tracing::debug!(
                    "task {} committed offsets for {} partitions",
                    self.shared.id,
                    offsets.len()
                );
            }
            Err(e) => tracing::warn!("commit failed: {}", e),
        }
    }

    /// Sleeps for the given duration, aborting promptly if stop is requested.
    fn sleep_interruptibly(&self, duration: Duration) -> Result<(), TaskError> {
        if self.shared.stop_requested() {
            return Err(TaskError::StopRequested);
        }

        match self.shared.stop_rx.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(TaskError::StopRequested),
            Err(RecvTimeoutError::Timeout) => Ok(()),
        }
    }

    /// Final cleanup: hard commit unless the task failed, close the adapter, publish the final
    /// state and signal the supervisor.
    fn shutdown(&self, error: bool) {
        if !error {
            self.shared.set_state(TaskState::Stopping);
        }

        let adapter = self.shared.adapter.read().clone();
        let producer = self.shared.producer.read().clone();

        if !error
            && let (Some(adapter), Some(producer)) = (adapter.as_ref(), producer.as_ref())
        {
            self.commit(CommitKind::Hard, &**adapter, &**producer);
        }

        if let Some(adapter) = adapter {
            adapter.close();
        }

        self.shared.set_state(if error {
            TaskState::Error
        } else {
            TaskState::Stopped
        });

        let _ = self.stopped_tx.try_send(());

        tracing::info!("task {} stopped", self.shared.id);
    }
}
