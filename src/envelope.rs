use crate::{
    datastream::{ConnectionString, ControlError, Datastream},
    partition::{CheckpointToken, SourcePartition},
};

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Envelope metadata key carrying the name of the cluster the record originated from.
pub const ORIGIN_CLUSTER: &str = "origin-cluster";

/// Envelope metadata key carrying the topic the record originated from.
pub const ORIGIN_TOPIC: &str = "origin-topic";

/// Envelope metadata key carrying the partition the record originated from.
pub const ORIGIN_PARTITION: &str = "origin-partition";

/// Envelope metadata key carrying the offset the record originated from.
pub const ORIGIN_OFFSET: &str = "origin-offset";

/// Envelope metadata key carrying the event timestamp in epoch milliseconds.
pub const EVENT_TIMESTAMP: &str = "event-timestamp";

/// Envelope metadata key carrying the source system append timestamp in epoch milliseconds.
/// Only present when the source record carries a log-append timestamp.
pub const SOURCE_TIMESTAMP: &str = "source-timestamp";

/// How the source system assigned the timestamp carried on a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimestampKind {
    /// The timestamp was set by the producing client when the record was created.
    Create,
    /// The timestamp was set by the source system when the record was appended to the log.
    LogAppend,
    /// The record carries no timestamp.
    None,
}

/// A raw record polled from one source partition.
#[derive(Clone, Debug)]
pub struct SourceRecord {
    /// Opaque key bytes, if the record has a key.
    pub key: Option<Vec<u8>>,
    /// Opaque value bytes, if the record has a value.
    pub value: Option<Vec<u8>>,
    /// Headers carried on the record.
    pub headers: HashMap<String, Vec<u8>>,
    /// Topic the record was read from.
    pub topic: String,
    /// Partition number the record was read from.
    pub partition: i32,
    /// Offset of the record within its partition.
    pub offset: i64,
    /// Record timestamp in epoch milliseconds, when one is present.
    pub timestamp: Option<i64>,
    /// How the timestamp was assigned.
    pub timestamp_kind: TimestampKind,
}

impl SourceRecord {
    /// Returns the identity of the partition the record was read from.
    pub fn source_partition(&self) -> SourcePartition {
        SourcePartition::new(self.topic.clone(), self.partition)
    }
}

/// Internal representation of a record in flight between a source and a destination. Carries the
/// origin coordinates as string metadata so any destination can persist them.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Opaque key bytes.
    pub key: Option<Vec<u8>>,
    /// Opaque value bytes.
    pub value: Option<Vec<u8>>,
    /// Headers copied from the source record, if any were present.
    pub headers: Option<HashMap<String, Vec<u8>>>,
    /// String-keyed metadata; always contains the origin coordinates and event timestamp.
    pub metadata: HashMap<String, String>,
}

/// An [`Envelope`] bound to its destination, ready to hand to a producer.
#[derive(Clone, Debug)]
pub struct ProducerRecord {
    /// The envelope to deliver.
    pub envelope: Envelope,
    /// Fully resolved destination connection string for the record.
    pub destination: String,
    /// Resolved destination topic.
    pub topic: String,
    /// Checkpoint token recording the source position of the record.
    pub checkpoint: CheckpointToken,
    /// Destination partition. Set when identity partitioning is enabled, otherwise the
    /// destination hashes the record key.
    pub partition: Option<i32>,
    /// Source timestamp of the event in epoch milliseconds.
    pub events_source_timestamp: i64,
}

/// Translates source records into producer records bound for a datastream's destination.
pub struct RecordTranslator {
    /// Name of the origin cluster, taken from the source connection string authority.
    origin_cluster: String,
    /// Parsed destination connection string.
    destination: ConnectionString,
    /// Whether the destination partition mirrors the source partition.
    identity_partitioning: bool,
}

impl RecordTranslator {
    /// Creates a new [`RecordTranslator`] for the given datastream snapshot.
    pub fn new(datastream: &Datastream) -> Result<Self, ControlError> {
        let source = ConnectionString::parse(&datastream.source)?;
        let destination = ConnectionString::parse(&datastream.destination)?;

        Ok(Self {
            origin_cluster: source.authority().to_string(),
            destination,
            identity_partitioning: datastream.identity_partitioning(),
        })
    }
    /// Translates one source record. The `read_time` is the instant the batch containing the
    /// record was polled and is used as the event timestamp for records that carry none.
    pub fn translate(&self, record: &SourceRecord, read_time: DateTime<Utc>) -> ProducerRecord {
        let event_timestamp = record
            .timestamp
            .filter(|_| record.timestamp_kind != TimestampKind::None)
            .unwrap_or_else(|| read_time.timestamp_millis());

        let mut metadata = HashMap::new();
        metadata.insert(String::from(ORIGIN_CLUSTER), self.origin_cluster.clone());
        metadata.insert(String::from(ORIGIN_TOPIC), record.topic.clone());
        metadata.insert(String::from(ORIGIN_PARTITION), record.partition.to_string());
        metadata.insert(String::from(ORIGIN_OFFSET), record.offset.to_string());
        metadata.insert(String::from(EVENT_TIMESTAMP), event_timestamp.to_string());

        if record.timestamp_kind == TimestampKind::LogAppend
            && let Some(ts) = record.timestamp
        {
            metadata.insert(String::from(SOURCE_TIMESTAMP), ts.to_string());
        }

        let headers = if record.headers.is_empty() {
            None
        } else {
            Some(record.headers.clone())
        };

        let envelope = Envelope {
            key: record.key.clone(),
            value: record.value.clone(),
            headers,
            metadata,
        };

        let partition = self.identity_partitioning.then_some(record.partition);

        ProducerRecord {
            envelope,
            destination: self.destination.resolve(&record.topic),
            topic: self.destination.topic_for(&record.topic),
            checkpoint: CheckpointToken::mirror(&record.source_partition(), record.offset),
            partition,
            events_source_timestamp: event_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastream::DatastreamStatus;

    fn mirror_datastream(identity: bool) -> Datastream {
        let mut metadata = HashMap::new();

        if identity {
            metadata.insert(
                String::from(crate::datastream::IDENTITY_PARTITIONING),
                String::from("true"),
            );
        }

        Datastream {
            name: String::from("mirror-events"),
            connector: String::from("kafkaMirror"),
            source: String::from("kafka://source:9092/.*"),
            destination: String::from("kafka://dest:9092/%s"),
            status: DatastreamStatus::Ready,
            metadata,
        }
    }

    fn record(topic: &str, offset: i64, kind: TimestampKind) -> SourceRecord {
        SourceRecord {
            key: Some(b"key".to_vec()),
            value: Some(b"value".to_vec()),
            headers: HashMap::new(),
            topic: String::from(topic),
            partition: 0,
            offset,
            timestamp: match kind {
                TimestampKind::None => None,
                _ => Some(1_700_000_000_000),
            },
            timestamp_kind: kind,
        }
    }

    #[test]
    fn translation_sets_origin_metadata() {
        let translator = RecordTranslator::new(&mirror_datastream(false)).unwrap();

        let translated = translator.translate(&record("A", 0, TimestampKind::Create), Utc::now());

        assert_eq!(translated.topic, "A");
        assert_eq!(translated.envelope.metadata[ORIGIN_CLUSTER], "source:9092");
        assert_eq!(translated.envelope.metadata[ORIGIN_TOPIC], "A");
        assert_eq!(translated.envelope.metadata[ORIGIN_PARTITION], "0");
        assert_eq!(translated.envelope.metadata[ORIGIN_OFFSET], "0");
        assert_eq!(
            translated.envelope.metadata[EVENT_TIMESTAMP],
            "1700000000000"
        );
        assert!(!translated.envelope.metadata.contains_key(SOURCE_TIMESTAMP));
        assert_eq!(translated.checkpoint.to_string(), "A-0-0");
        assert_eq!(translated.partition, None);
    }

    #[test]
    fn log_append_timestamps_carry_source_timestamp() {
        let translator = RecordTranslator::new(&mirror_datastream(false)).unwrap();

        let translated =
            translator.translate(&record("B", 5, TimestampKind::LogAppend), Utc::now());

        assert_eq!(
            translated.envelope.metadata[SOURCE_TIMESTAMP],
            "1700000000000"
        );
        assert_eq!(translated.events_source_timestamp, 1_700_000_000_000);
    }

    #[test]
    fn missing_timestamp_falls_back_to_read_time() {
        let translator = RecordTranslator::new(&mirror_datastream(false)).unwrap();
        let read_time = Utc::now();

        let translated = translator.translate(&record("C", 2, TimestampKind::None), read_time);

        assert_eq!(
            translated.envelope.metadata[EVENT_TIMESTAMP],
            read_time.timestamp_millis().to_string()
        );
    }

    #[test]
    fn identity_partitioning_copies_source_partition() {
        let translator = RecordTranslator::new(&mirror_datastream(true)).unwrap();

        let translated = translator.translate(&record("A", 0, TimestampKind::Create), Utc::now());

        assert_eq!(translated.partition, Some(0));
    }
}
