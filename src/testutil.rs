//! In-memory source adapter, producer and connector used by the unit tests across the crate.

use crate::{
    config::TaskConfig,
    connector::{AlwaysReady, TaskConnector, TopicReadiness},
    datastream::{Datastream, DatastreamStatus},
    envelope::{ProducerRecord, SourceRecord, TimestampKind},
    partition::{PartitionInfo, SourcePartition},
    producer::{AckCallback, ProducerError, ProducerHandle},
    source::{
        AdapterSession, AssignmentListener, RecordBatch, SourceAdapter, SourceError,
        SourceResult, SubscriptionTarget,
    },
};

use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// What a seek call against the mock adapter asked for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum SeekTarget {
    Offset(i64),
    Beginning,
    End,
}

/// Scripted in-memory source adapter. Polls pop pre-loaded outcomes; every mutating call is
/// recorded so tests can assert on the interaction history.
pub(crate) struct MockSourceAdapter {
    /// Partitions handed to the listener when the subscription is established.
    initial_assignment: Vec<SourcePartition>,
    /// Scripted poll outcomes, popped front to back. An exhausted script polls empty.
    polls: Mutex<VecDeque<SourceResult<RecordBatch>>>,
    assignment: RwLock<HashSet<SourcePartition>>,
    paused: RwLock<HashSet<SourcePartition>>,
    /// Every commit call in order, for monotonicity assertions.
    commits: Mutex<Vec<HashMap<SourcePartition, i64>>>,
    committed: Mutex<HashMap<SourcePartition, i64>>,
    seeks: Mutex<Vec<(SourcePartition, SeekTarget)>>,
    listener: RwLock<Option<Arc<dyn AssignmentListener>>>,
    wakeup: AtomicBool,
    closed: AtomicBool,
    /// When set, polls block until wakeup or close, simulating a stalled source.
    hang: AtomicBool,
}

impl MockSourceAdapter {
    /// Creates a mock adapter that assigns the given partitions at subscribe time.
    pub(crate) fn new(initial_assignment: Vec<SourcePartition>) -> Arc<Self> {
        Arc::new(Self {
            initial_assignment,
            polls: Mutex::new(VecDeque::new()),
            assignment: RwLock::new(HashSet::new()),
            paused: RwLock::new(HashSet::new()),
            commits: Mutex::new(Vec::new()),
            committed: Mutex::new(HashMap::new()),
            seeks: Mutex::new(Vec::new()),
            listener: RwLock::new(None),
            wakeup: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        })
    }
    /// Queues a successful poll outcome.
    pub(crate) fn script_poll(&self, batch: RecordBatch) {
        self.polls.lock().push_back(Ok(batch));
    }
    /// Queues a failing poll outcome.
    pub(crate) fn script_error(&self, error: SourceError) {
        self.polls.lock().push_back(Err(error));
    }
    /// Makes subsequent polls block until wakeup or close.
    pub(crate) fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
    /// Returns every commit call made against the adapter, in order.
    pub(crate) fn commit_history(&self) -> Vec<HashMap<SourcePartition, i64>> {
        self.commits.lock().clone()
    }
    /// Returns the latest committed offset per partition.
    pub(crate) fn committed_map(&self) -> HashMap<SourcePartition, i64> {
        self.committed.lock().clone()
    }
    /// Returns every seek call made against the adapter, in order.
    pub(crate) fn seeks(&self) -> Vec<(SourcePartition, SeekTarget)> {
        self.seeks.lock().clone()
    }
    /// Returns the currently paused partitions.
    pub(crate) fn paused_set(&self) -> HashSet<SourcePartition> {
        self.paused.read().clone()
    }
    /// Returns true once the adapter has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
    /// Simulates the source revoking partitions, dispatching the listener the way a real
    /// adapter would from within poll.
    pub(crate) fn trigger_revoke(&self, partitions: &[SourcePartition]) {
        if let Some(listener) = self.listener.read().clone() {
            listener.on_revoked(&MockSession { adapter: self }, partitions);
        }

        self.assignment
            .write()
            .retain(|p| !partitions.contains(p));
        self.paused.write().retain(|p| !partitions.contains(p));
    }
    /// Simulates the source assigning additional partitions.
    pub(crate) fn trigger_assign(&self, partitions: &[SourcePartition]) {
        self.assignment.write().extend(partitions.iter().cloned());

        if let Some(listener) = self.listener.read().clone() {
            listener.on_assigned(&MockSession { adapter: self }, partitions);
        }
    }
}

/// Rebalance-scoped session for the mock adapter.
struct MockSession<'a> {
    adapter: &'a MockSourceAdapter,
}

impl AdapterSession for MockSession<'_> {
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        self.adapter.paused.write().extend(partitions.iter().cloned());
        Ok(())
    }
    fn commit_sync(&self, offsets: &HashMap<SourcePartition, i64>) -> SourceResult<()> {
        self.adapter.commits.lock().push(offsets.clone());
        self.adapter.committed.lock().extend(offsets.clone());
        Ok(())
    }
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>> {
        Ok(self.adapter.committed.lock().get(partition).copied())
    }
}

impl SourceAdapter for MockSourceAdapter {
    fn subscribe(
        &self,
        _target: &SubscriptionTarget,
        listener: Arc<dyn AssignmentListener>,
    ) -> SourceResult<()> {
        *self.listener.write() = Some(Arc::clone(&listener));

        self.assignment
            .write()
            .extend(self.initial_assignment.iter().cloned());

        listener.on_assigned(&MockSession { adapter: self }, &self.initial_assignment);

        Ok(())
    }
    fn poll(&self, timeout: Duration) -> SourceResult<RecordBatch> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(SourceError::Closed);
            }

            if self.wakeup.swap(false, Ordering::SeqCst) {
                return Err(SourceError::WakeupTriggered);
            }

            if self.hang.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }

            break;
        }

        match self.polls.lock().pop_front() {
            Some(outcome) => outcome,
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Ok(RecordBatch::new())
            }
        }
    }
    fn assignment(&self) -> SourceResult<HashSet<SourcePartition>> {
        Ok(self.assignment.read().clone())
    }
    fn paused(&self) -> SourceResult<HashSet<SourcePartition>> {
        Ok(self.paused.read().clone())
    }
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        self.paused.write().extend(partitions.iter().cloned());
        Ok(())
    }
    fn resume(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        self.paused.write().retain(|p| !partitions.contains(p));
        Ok(())
    }
    fn seek(&self, partition: &SourcePartition, offset: i64) -> SourceResult<()> {
        self.seeks
            .lock()
            .push((partition.clone(), SeekTarget::Offset(offset)));
        Ok(())
    }
    fn seek_to_beginning(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        let mut seeks = self.seeks.lock();

        for partition in partitions {
            seeks.push((partition.clone(), SeekTarget::Beginning));
        }

        Ok(())
    }
    fn seek_to_end(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        let mut seeks = self.seeks.lock();

        for partition in partitions {
            seeks.push((partition.clone(), SeekTarget::End));
        }

        Ok(())
    }
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>> {
        Ok(self.committed.lock().get(partition).copied())
    }
    fn commit_sync(&self, offsets: Option<&HashMap<SourcePartition, i64>>) -> SourceResult<()> {
        if let Some(offsets) = offsets {
            self.commits.lock().push(offsets.clone());
            self.committed.lock().extend(offsets.clone());
        }

        Ok(())
    }
    fn partitions_for(&self, topic: &str) -> SourceResult<Vec<PartitionInfo>> {
        Ok(self
            .assignment
            .read()
            .iter()
            .filter(|p| p.topic() == topic)
            .map(|p| PartitionInfo {
                topic: String::from(p.topic()),
                partition: p.partition(),
            })
            .collect())
    }
    fn wakeup(&self) {
        self.wakeup.store(true, Ordering::SeqCst);
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Shared state of the mock producer.
struct MockProducerInner {
    /// When true, acks are held until the test releases them.
    manual: bool,
    /// Every record accepted by the producer, in submission order.
    sent: Mutex<Vec<ProducerRecord>>,
    /// Held acks keyed by origin offset, in submission order.
    pending: Mutex<Vec<(i64, AckCallback)>>,
    /// Origin offsets whose submission fails synchronously.
    fail_offsets: Mutex<HashSet<i64>>,
}

/// Recording in-memory producer. In immediate mode every send is acknowledged successfully on
/// the spot; in manual mode the test decides when and how each record completes.
#[derive(Clone)]
pub(crate) struct MockProducer {
    inner: Arc<MockProducerInner>,
}

impl MockProducer {
    /// Creates a producer that acknowledges every record immediately.
    pub(crate) fn immediate() -> Self {
        Self::build(false)
    }
    /// Creates a producer that holds acknowledgements until the test releases them.
    pub(crate) fn manual() -> Self {
        Self::build(true)
    }

    fn build(manual: bool) -> Self {
        Self {
            inner: Arc::new(MockProducerInner {
                manual,
                sent: Mutex::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                fail_offsets: Mutex::new(HashSet::new()),
            }),
        }
    }
    /// Makes submissions of records with the given origin offset fail synchronously.
    pub(crate) fn fail_sends_at(&self, offset: i64) {
        self.inner.fail_offsets.lock().insert(offset);
    }
    /// Returns every record accepted so far.
    pub(crate) fn sent(&self) -> Vec<ProducerRecord> {
        self.inner.sent.lock().clone()
    }
    /// Acknowledges the oldest pending record with the given origin offset.
    pub(crate) fn ack_offset(&self, offset: i64) {
        if let Some(ack) = self.take_pending(offset) {
            ack(Ok(()));
        }
    }
    /// Fails the oldest pending record with the given origin offset.
    pub(crate) fn fail_offset(&self, offset: i64, error: ProducerError) {
        if let Some(ack) = self.take_pending(offset) {
            ack(Err(error));
        }
    }

    fn take_pending(&self, offset: i64) -> Option<AckCallback> {
        let mut pending = self.inner.pending.lock();

        pending
            .iter()
            .position(|(o, _)| *o == offset)
            .map(|index| pending.remove(index).1)
    }
}

impl ProducerHandle for MockProducer {
    fn send(&self, record: ProducerRecord, ack: AckCallback) -> Result<(), ProducerError> {
        let offset = record.checkpoint.offset();

        if self.inner.fail_offsets.lock().contains(&offset) {
            return Err(ProducerError::Rejected(String::from("scripted failure")));
        }

        self.inner.sent.lock().push(record);

        if self.inner.manual {
            self.inner.pending.lock().push((offset, ack));
        } else {
            ack(Ok(()));
        }

        Ok(())
    }
    fn flush(&self, _timeout: Duration) -> Result<(), ProducerError> {
        let pending: Vec<(i64, AckCallback)> =
            std::mem::take(&mut *self.inner.pending.lock());

        for (_, ack) in pending {
            ack(Ok(()));
        }

        Ok(())
    }
}

/// Connector wrapping pre-built mock collaborators. Adapters are handed out front to back so a
/// test can script a different adapter for a restarted task; the last one is reused once the
/// queue runs down to it.
pub(crate) struct MockConnector {
    adapters: Mutex<VecDeque<Arc<MockSourceAdapter>>>,
    producer: MockProducer,
    readiness: Arc<dyn TopicReadiness>,
}

impl MockConnector {
    /// Creates a connector handing out the given adapter and producer.
    pub(crate) fn new(adapter: Arc<MockSourceAdapter>, producer: MockProducer) -> Arc<Self> {
        Self::with_readiness(adapter, producer, Arc::new(AlwaysReady))
    }
    /// Creates a connector with a custom destination readiness hook.
    pub(crate) fn with_readiness(
        adapter: Arc<MockSourceAdapter>,
        producer: MockProducer,
        readiness: Arc<dyn TopicReadiness>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters: Mutex::new(VecDeque::from([adapter])),
            producer,
            readiness,
        })
    }
    /// Queues an adapter to hand to the next task the connector opens.
    pub(crate) fn push_adapter(&self, adapter: Arc<MockSourceAdapter>) {
        self.adapters.lock().push_back(adapter);
    }
}

impl TaskConnector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }
    fn source_adapter(&self, _datastream: &Datastream) -> anyhow::Result<Arc<dyn SourceAdapter>> {
        let mut adapters = self.adapters.lock();

        let adapter = if adapters.len() > 1 {
            adapters.pop_front().expect("adapter queued")
        } else {
            Arc::clone(adapters.front().expect("adapter queued"))
        };

        Ok(adapter as Arc<dyn SourceAdapter>)
    }
    fn producer_handle(
        &self,
        _datastream: &Datastream,
    ) -> anyhow::Result<Arc<dyn ProducerHandle>> {
        Ok(Arc::new(self.producer.clone()))
    }
    fn subscription(&self, _datastream: &Datastream) -> anyhow::Result<SubscriptionTarget> {
        Ok(SubscriptionTarget::Pattern(String::from(".*")))
    }
    fn topic_readiness(&self) -> Arc<dyn TopicReadiness> {
        Arc::clone(&self.readiness)
    }
}

/// Builds a record for the given source position with a create timestamp.
pub(crate) fn record(topic: &str, partition: i32, offset: i64) -> SourceRecord {
    SourceRecord {
        key: Some(format!("key-{}", offset).into_bytes()),
        value: Some(format!("value-{}", offset).into_bytes()),
        headers: HashMap::new(),
        topic: String::from(topic),
        partition,
        offset,
        timestamp: Some(1_700_000_000_000 + offset),
        timestamp_kind: TimestampKind::Create,
    }
}

/// Builds a batch from the given records.
pub(crate) fn batch(records: Vec<SourceRecord>) -> RecordBatch {
    let mut batch = RecordBatch::new();

    for record in records {
        batch.push(record);
    }

    batch
}

/// Builds a mirror datastream snapshot with the given metadata.
pub(crate) fn test_datastream(
    name: &str,
    metadata: HashMap<String, String>,
) -> Datastream {
    Datastream {
        name: String::from(name),
        connector: String::from("mock"),
        source: String::from("kafka://source:9092/.*"),
        destination: String::from("kafka://dest:9092/%s"),
        status: DatastreamStatus::Ready,
        metadata,
    }
}

/// Task configuration with intervals small enough for tests to complete quickly.
pub(crate) fn fast_config() -> TaskConfig {
    TaskConfig {
        offset_commit_interval: Duration::from_millis(100),
        retry_sleep: Duration::from_millis(5),
        ..TaskConfig::default()
    }
}
