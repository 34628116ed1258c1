use crate::{
    envelope::{SourceRecord, TimestampKind},
    partition::{PartitionInfo, SourcePartition},
    source::{
        AdapterSession, AssignmentListener, RecordBatch, SourceAdapter, SourceError,
        SourceResult, SubscriptionTarget,
    },
    util,
};

use anyhow::Context;
use parking_lot::RwLock;
use rdkafka::{
    ClientConfig, ClientContext, Message, Offset, Timestamp, TopicPartitionList,
    config::RDKafkaLogLevel,
    consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance},
    error::{KafkaError, KafkaResult},
    message::{BorrowedMessage, Headers},
    types::RDKafkaErrorCode,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// How long a single poll against the underlying consumer blocks before the wakeup flag is
/// checked again. librdkafka cannot interrupt an in-progress poll from another thread, so the
/// caller's timeout is sliced into short polls with the flag checked in between.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Timeout applied to synchronous client calls against the broker: metadata fetches, committed
/// offset lookups and seeks.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between the adapter and its consumer context. The context runs inside the
/// polling thread, so no callback ever races the poll loop itself.
struct ContextShared {
    /// Listener receiving assignment changes, installed at subscribe time.
    listener: RwLock<Option<Arc<dyn AssignmentListener>>>,
    /// Partitions currently paused on the consumer. librdkafka does not expose the paused set,
    /// so the adapter maintains it and prunes it when partitions are revoked.
    paused: RwLock<HashSet<SourcePartition>>,
    /// Set to interrupt an in-progress or subsequent poll.
    wakeup: AtomicBool,
    /// Set once the adapter has been closed.
    closed: AtomicBool,
}

/// Consumer context that forwards librdkafka logs to tracing and dispatches rebalance events to
/// the installed [`AssignmentListener`] on the polling thread.
struct MirrorConsumerContext {
    /// State shared with the adapter.
    shared: Arc<ContextShared>,
}

impl ClientContext for MirrorConsumerContext {
    /// Routes log lines from the native client to the tracing subscriber.
    fn log(&self, level: RDKafkaLogLevel, facility: &str, message: &str) {
        util::forward_client_log(level, facility, message);
    }
}

impl ConsumerContext for MirrorConsumerContext {
    /// Hook invoked right before the consumer begins rebalancing. Revocations are dispatched
    /// from here so the listener can commit progress while the partitions are still owned.
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let revoked = partitions_of(tpl);

            revoked
                .iter()
                .for_each(|p| tracing::info!("revoking partition {}", p));

            self.shared
                .paused
                .write()
                .retain(|p| !revoked.contains(p));

            if let Some(listener) = self.shared.listener.read().clone() {
                let session = KafkaSession {
                    consumer: base_consumer,
                };

                listener.on_revoked(&session, &revoked);
            }
        }
    }
    /// Hook invoked after the consumer rebalancing has been completed. Assignments are
    /// dispatched from here, before the consumer hands out any records for the new partitions.
    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let assigned = partitions_of(tpl);

                assigned
                    .iter()
                    .for_each(|p| tracing::info!("assigned partition {}", p));

                if let Some(listener) = self.shared.listener.read().clone() {
                    let session = KafkaSession {
                        consumer: base_consumer,
                    };

                    listener.on_assigned(&session, &assigned);
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => tracing::error!("error during rebalance: {}", e),
        }
    }
    /// Hook invoked after the consumer has attempted to commit offsets. The task loop logs the
    /// offsets it commits itself, so only the confirmation or failure is recorded here.
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                tracing::debug!(
                    "source confirmed offset commit for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => tracing::error!("source rejected offset commit: {}", e),
        }
    }
}

/// Rebalance-scoped [`AdapterSession`] backed by the consumer reference the rebalance callback
/// receives. Lets assignment listeners pause partitions and commit offsets while the rebalance
/// is still in progress.
struct KafkaSession<'a> {
    /// The consumer performing the rebalance.
    consumer: &'a BaseConsumer<MirrorConsumerContext>,
}

impl AdapterSession for KafkaSession<'_> {
    /// Pauses consumption of the given partitions before the rebalance completes.
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }

        self.consumer
            .pause(&plain_tpl(partitions))
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        self.consumer
            .context()
            .shared
            .paused
            .write()
            .extend(partitions.iter().cloned());

        Ok(())
    }
    /// Synchronously commits the given offsets from within the rebalance callback.
    fn commit_sync(&self, offsets: &HashMap<SourcePartition, i64>) -> SourceResult<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let tpl = offset_tpl(offsets)?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| SourceError::Transient(e.to_string()))
    }
    /// Returns the committed offset for the given partition, if one exists.
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>> {
        committed_offset(self.consumer, partition)
    }
}

/// Source adapter for a partitioned log system, backed by an [`rdkafka`] consumer. Driven by a
/// single task loop thread; rebalance callbacks are delivered synchronously from within `poll`.
pub struct KafkaSourceAdapter {
    /// The underlying consumer.
    consumer: BaseConsumer<MirrorConsumerContext>,
    /// State shared with the consumer context.
    shared: Arc<ContextShared>,
    /// Maximum number of records returned by a single poll.
    max_poll_records: usize,
}

impl KafkaSourceAdapter {
    /// Creates a new [`KafkaSourceAdapter`] for the given consumer group. Additional consumer
    /// properties are applied on top of the defaults; auto commit is always disabled and missing
    /// committed offsets always surface as [`SourceError::NoOffsetForPartitions`] rather than
    /// being reset by the client library.
    pub fn new(
        group_id: impl AsRef<str>,
        bootstrap_servers: impl AsRef<str>,
        properties: HashMap<String, String>,
        max_poll_records: usize,
    ) -> anyhow::Result<Self> {
        let mut client_config = ClientConfig::new();

        // apply default config
        client_config.set("group.id", group_id.as_ref());
        client_config.set("bootstrap.servers", bootstrap_servers.as_ref());

        // apply user config
        client_config.extend(properties);

        // apply enforced config
        client_config.set("enable.auto.commit", "false");
        client_config.set("auto.offset.reset", "error");

        if tracing::enabled!(tracing::Level::DEBUG) {
            for (key, value) in client_config.config_map().iter() {
                tracing::debug!("source consumer configured with {}={}", key, value);
            }
        }

        let shared = Arc::new(ContextShared {
            listener: RwLock::new(None),
            paused: RwLock::new(HashSet::new()),
            wakeup: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let context = MirrorConsumerContext {
            shared: Arc::clone(&shared),
        };

        let consumer: BaseConsumer<MirrorConsumerContext> = client_config
            .set_log_level(RDKafkaLogLevel::Debug)
            .create_with_context(context)
            .context("create Kafka consumer")?;

        Ok(Self {
            consumer,
            shared,
            max_poll_records,
        })
    }

    /// Maps an error from the underlying client onto the source adapter error contract.
    fn map_error(&self, error: KafkaError) -> SourceError {
        match error {
            KafkaError::MessageConsumption(code) => match code {
                RDKafkaErrorCode::AutoOffsetReset | RDKafkaErrorCode::NoOffset => {
                    SourceError::NoOffsetForPartitions(self.partitions_missing_offsets())
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    SourceError::OffsetOutOfRange(HashMap::new())
                }
                _ => SourceError::Transient(error.to_string()),
            },
            _ => SourceError::Transient(error.to_string()),
        }
    }

    /// Returns the assigned partitions that have no committed offset, used to attribute a
    /// missing offset error to partitions.
    fn partitions_missing_offsets(&self) -> HashSet<SourcePartition> {
        let assignment = match self.consumer.assignment() {
            Ok(tpl) => tpl,
            Err(e) => {
                tracing::warn!("failed to fetch assignment for offset attribution: {}", e);
                return HashSet::new();
            }
        };

        match self
            .consumer
            .committed_offsets(assignment, CLIENT_TIMEOUT)
        {
            Ok(tpl) => tpl
                .elements()
                .iter()
                .filter(|e| !matches!(e.offset(), Offset::Offset(_)))
                .map(|e| SourcePartition::new(e.topic(), e.partition()))
                .collect(),
            Err(e) => {
                tracing::warn!("failed to fetch committed offsets: {}", e);
                HashSet::new()
            }
        }
    }
}

impl SourceAdapter for KafkaSourceAdapter {
    /// Subscribes the consumer to the given target. A pattern target is anchored and handed to
    /// the broker-side regex subscription.
    fn subscribe(
        &self,
        target: &SubscriptionTarget,
        listener: Arc<dyn AssignmentListener>,
    ) -> SourceResult<()> {
        let mut installed = self.shared.listener.write();

        if installed.is_some() {
            return Err(SourceError::Transient(String::from(
                "adapter is already subscribed",
            )));
        }

        *installed = Some(listener);
        drop(installed);

        let topics = match target {
            SubscriptionTarget::Topics(topics) => topics.clone(),
            SubscriptionTarget::Pattern(pattern) => {
                let anchored = if pattern.starts_with('^') {
                    pattern.clone()
                } else {
                    format!("^{}", pattern)
                };

                vec![anchored]
            }
        };

        tracing::info!("subscribing Kafka consumer to {:?}", topics);

        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();

        self.consumer
            .subscribe(&refs)
            .map_err(|e| SourceError::Transient(e.to_string()))
    }
    /// Polls for records, blocking up to `timeout`. The timeout is sliced so a wakeup from
    /// another thread interrupts the poll within one slice.
    fn poll(&self, timeout: Duration) -> SourceResult<RecordBatch> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let mut batch = RecordBatch::new();

        loop {
            if self.shared.wakeup.swap(false, Ordering::SeqCst) {
                return Err(SourceError::WakeupTriggered);
            }

            let now = Instant::now();

            if now >= deadline {
                return Ok(batch);
            }

            let slice = POLL_SLICE.min(deadline - now);

            match self.consumer.poll(slice) {
                None => continue,
                Some(Ok(message)) => {
                    batch.push(convert(&message));

                    // drain whatever the client already fetched without blocking again.
                    while batch.len() < self.max_poll_records {
                        match self.consumer.poll(Duration::ZERO) {
                            Some(Ok(message)) => batch.push(convert(&message)),
                            Some(Err(e)) => {
                                tracing::warn!("error draining fetched records: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }

                    return Ok(batch);
                }
                Some(Err(e)) => return Err(self.map_error(e)),
            }
        }
    }
    /// Returns the partitions currently assigned to the consumer.
    fn assignment(&self) -> SourceResult<HashSet<SourcePartition>> {
        self.consumer
            .assignment()
            .map(|tpl| partitions_of(&tpl).into_iter().collect())
            .map_err(|e| SourceError::Transient(e.to_string()))
    }
    /// Returns the partitions currently paused on the consumer.
    fn paused(&self) -> SourceResult<HashSet<SourcePartition>> {
        Ok(self.shared.paused.read().clone())
    }
    /// Pauses consumption of the given partitions.
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }

        self.consumer
            .pause(&plain_tpl(partitions))
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        self.shared.paused.write().extend(partitions.iter().cloned());

        Ok(())
    }
    /// Resumes consumption of the given partitions.
    fn resume(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }

        self.consumer
            .resume(&plain_tpl(partitions))
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        self.shared
            .paused
            .write()
            .retain(|p| !partitions.contains(p));

        Ok(())
    }
    /// Seeks the given partition so the next poll reads from `offset`.
    fn seek(&self, partition: &SourcePartition, offset: i64) -> SourceResult<()> {
        self.consumer
            .seek(
                partition.topic(),
                partition.partition(),
                Offset::Offset(offset),
                CLIENT_TIMEOUT,
            )
            .map_err(|e| SourceError::Transient(e.to_string()))
    }
    /// Seeks the given partitions to the earliest retained offset.
    fn seek_to_beginning(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        for partition in partitions {
            self.consumer
                .seek(
                    partition.topic(),
                    partition.partition(),
                    Offset::Beginning,
                    CLIENT_TIMEOUT,
                )
                .map_err(|e| SourceError::Transient(e.to_string()))?;
        }

        Ok(())
    }
    /// Seeks the given partitions to the log end.
    fn seek_to_end(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        for partition in partitions {
            self.consumer
                .seek(
                    partition.topic(),
                    partition.partition(),
                    Offset::End,
                    CLIENT_TIMEOUT,
                )
                .map_err(|e| SourceError::Transient(e.to_string()))?;
        }

        Ok(())
    }
    /// Returns the committed offset for the given partition, if one exists.
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>> {
        committed_offset(&self.consumer, partition)
    }
    /// Synchronously commits the given offsets, or the consumer's own stored positions when no
    /// explicit map is provided.
    fn commit_sync(&self, offsets: Option<&HashMap<SourcePartition, i64>>) -> SourceResult<()> {
        match offsets {
            Some(offsets) => {
                if offsets.is_empty() {
                    return Ok(());
                }

                let tpl = offset_tpl(offsets)?;

                self.consumer
                    .commit(&tpl, CommitMode::Sync)
                    .map_err(|e| SourceError::Transient(e.to_string()))
            }
            None => self
                .consumer
                .commit_consumer_state(CommitMode::Sync)
                .map_err(|e| SourceError::Transient(e.to_string())),
        }
    }
    /// Returns the partitions of the given topic as reported by the broker.
    fn partitions_for(&self, topic: &str) -> SourceResult<Vec<PartitionInfo>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), CLIENT_TIMEOUT)
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        Ok(metadata
            .topics()
            .iter()
            .flat_map(|t| {
                t.partitions()
                    .iter()
                    .map(|p| PartitionInfo {
                        topic: String::from(t.name()),
                        partition: p.id(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect())
    }
    /// Interrupts an in-progress or subsequent poll. Safe to call from any thread.
    fn wakeup(&self) {
        self.shared.wakeup.store(true, Ordering::SeqCst);
    }
    /// Unsubscribes the consumer and marks the adapter closed. Idempotent.
    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("closing Kafka source adapter");
            self.consumer.unsubscribe();
        }
    }
}

/// Converts a consumed message into a [`SourceRecord`].
fn convert(message: &BorrowedMessage<'_>) -> SourceRecord {
    let key = message.key().map(Vec::from);
    let value = message.payload().map(Vec::from);

    let mut headers = HashMap::new();

    if let Some(hs) = message.headers() {
        for h in hs.iter() {
            if let Some(v) = h.value {
                headers.insert(String::from(h.key), Vec::from(v));
            }
        }
    }

    let (timestamp, timestamp_kind) = match message.timestamp() {
        Timestamp::CreateTime(ms) => (Some(ms), TimestampKind::Create),
        Timestamp::LogAppendTime(ms) => (Some(ms), TimestampKind::LogAppend),
        Timestamp::NotAvailable => (None, TimestampKind::None),
    };

    SourceRecord {
        key,
        value,
        headers,
        topic: String::from(message.topic()),
        partition: message.partition(),
        offset: message.offset(),
        timestamp,
        timestamp_kind,
    }
}

/// Collects the partitions of a [`TopicPartitionList`].
fn partitions_of(tpl: &TopicPartitionList) -> Vec<SourcePartition> {
    tpl.elements()
        .iter()
        .map(|e| SourcePartition::new(e.topic(), e.partition()))
        .collect()
}

/// Builds a [`TopicPartitionList`] containing the given partitions without offsets.
fn plain_tpl(partitions: &HashSet<SourcePartition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::with_capacity(partitions.len());

    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition());
    }

    tpl
}

/// Builds a [`TopicPartitionList`] carrying the given offsets.
fn offset_tpl(offsets: &HashMap<SourcePartition, i64>) -> SourceResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::with_capacity(offsets.len());

    for (partition, offset) in offsets {
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition(),
            Offset::Offset(*offset),
        )
        .map_err(|e| SourceError::Transient(e.to_string()))?;
    }

    Ok(tpl)
}

/// Looks up the committed offset for one partition.
fn committed_offset(
    consumer: &BaseConsumer<MirrorConsumerContext>,
    partition: &SourcePartition,
) -> SourceResult<Option<i64>> {
    let mut tpl = TopicPartitionList::with_capacity(1);
    tpl.add_partition(partition.topic(), partition.partition());

    let committed = consumer
        .committed_offsets(tpl, CLIENT_TIMEOUT)
        .map_err(|e| SourceError::Transient(e.to_string()))?;

    Ok(committed.elements().first().and_then(|e| match e.offset() {
        Offset::Offset(offset) => Some(offset),
        _ => None,
    }))
}
