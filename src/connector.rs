use crate::{
    datastream::{ConnectionString, Datastream},
    partition::SourcePartition,
    producer::{ProducerHandle, kafka::KafkaProducerHandle},
    source::{SourceAdapter, SubscriptionTarget, kafka::KafkaSourceAdapter},
};

use anyhow::Context;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Destination-readiness hook consulted when partitions are assigned to a task. Partitions
/// reported as not ready are paused before the assignment callback returns, so no records for
/// them are delivered by the poll the rebalance happened in. Implementations typically create
/// the destination topic and report it unready until creation completes.
pub trait TopicReadiness: Send + Sync {
    /// Returns the subset of the given partitions whose destination is not ready to accept
    /// records.
    fn unready_partitions(&self, partitions: &[SourcePartition]) -> HashSet<SourcePartition>;
    /// Returns true when the destination for the given partition has become ready. Consulted
    /// when deciding whether a readiness pause can lift.
    fn is_ready(&self, partition: &SourcePartition) -> bool;
}

/// Default readiness hook: every destination is always ready.
pub struct AlwaysReady;

impl TopicReadiness for AlwaysReady {
    /// Reports every partition as ready.
    fn unready_partitions(&self, _partitions: &[SourcePartition]) -> HashSet<SourcePartition> {
        HashSet::new()
    }
    /// Reports the destination as ready.
    fn is_ready(&self, _partition: &SourcePartition) -> bool {
        true
    }
}

/// Builds the per-datastream collaborators of a task: the source adapter, the producer handle,
/// the subscription and the destination readiness hook. One connector instance serves every
/// datastream registered under its name.
pub trait TaskConnector: Send + Sync {
    /// Returns the name tasks of this connector are registered under.
    fn name(&self) -> &str;
    /// Opens a source adapter for the given datastream.
    fn source_adapter(&self, datastream: &Datastream) -> anyhow::Result<Arc<dyn SourceAdapter>>;
    /// Opens a producer handle for the given datastream.
    fn producer_handle(&self, datastream: &Datastream)
    -> anyhow::Result<Arc<dyn ProducerHandle>>;
    /// Returns what the task subscribes to for the given datastream.
    fn subscription(&self, datastream: &Datastream) -> anyhow::Result<SubscriptionTarget>;
    /// Returns the destination readiness hook for tasks of this connector.
    fn topic_readiness(&self) -> Arc<dyn TopicReadiness> {
        Arc::new(AlwaysReady)
    }
}

/// Connector that mirrors records between two partitioned log clusters. The source connection
/// string carries the origin brokers and a topic regex as its path; the destination connection
/// string carries the target brokers and an optional `%s` topic template.
pub struct KafkaMirrorConnector {
    /// Name tasks of this connector are registered under.
    name: String,
    /// Additional properties applied to every source consumer.
    consumer_properties: HashMap<String, String>,
    /// Additional properties applied to every destination producer.
    producer_properties: HashMap<String, String>,
    /// Maximum number of records a source adapter returns per poll.
    max_poll_records: usize,
}

impl KafkaMirrorConnector {
    /// Creates a new [`KafkaMirrorConnector`].
    pub fn new(
        name: impl Into<String>,
        consumer_properties: HashMap<String, String>,
        producer_properties: HashMap<String, String>,
        max_poll_records: usize,
    ) -> Self {
        Self {
            name: name.into(),
            consumer_properties,
            producer_properties,
            max_poll_records,
        }
    }
}

impl TaskConnector for KafkaMirrorConnector {
    /// Returns the name tasks of this connector are registered under.
    fn name(&self) -> &str {
        &self.name
    }
    /// Opens a consumer against the brokers named by the source connection string, using the
    /// datastream's derived group id.
    fn source_adapter(&self, datastream: &Datastream) -> anyhow::Result<Arc<dyn SourceAdapter>> {
        let source = ConnectionString::parse(&datastream.source)
            .context("parse source connection string")?;

        let adapter = KafkaSourceAdapter::new(
            datastream.group_id(),
            source.authority(),
            self.consumer_properties.clone(),
            self.max_poll_records,
        )
        .context("open Kafka source adapter")?;

        Ok(Arc::new(adapter))
    }
    /// Opens a producer against the brokers named by the destination connection string.
    fn producer_handle(
        &self,
        datastream: &Datastream,
    ) -> anyhow::Result<Arc<dyn ProducerHandle>> {
        let destination = ConnectionString::parse(&datastream.destination)
            .context("parse destination connection string")?;

        let handle =
            KafkaProducerHandle::new(destination.authority(), self.producer_properties.clone())
                .context("open Kafka producer")?;

        Ok(Arc::new(handle))
    }
    /// Subscribes to the topic regex carried as the path of the source connection string. An
    /// empty path mirrors every topic.
    fn subscription(&self, datastream: &Datastream) -> anyhow::Result<SubscriptionTarget> {
        let source = ConnectionString::parse(&datastream.source)
            .context("parse source connection string")?;

        let pattern = if source.path().is_empty() {
            String::from(".*")
        } else {
            String::from(source.path())
        };

        regex::Regex::new(&pattern)
            .with_context(|| format!("invalid source topic pattern {}", pattern))?;

        Ok(SubscriptionTarget::Pattern(pattern))
    }
}
