use crate::{
    envelope::ProducerRecord,
    producer::{AckCallback, ProducerError, ProducerHandle},
    util,
};

use anyhow::Context;
use parking_lot::Mutex;
use rdkafka::{
    ClientConfig, ClientContext,
    config::RDKafkaLogLevel,
    error::KafkaError,
    message::{Header, OwnedHeaders},
    producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer},
    types::RDKafkaErrorCode,
};
use std::{collections::HashMap, time::Duration};

/// Number of times a send is re-attempted while the producer queue is full before the error is
/// surfaced to the caller.
const SUBMIT_ATTEMPTS: u32 = 10;

/// Delay between attempts to enqueue a record while the producer queue is full.
const SUBMIT_BACKOFF: Duration = Duration::from_millis(100);

/// Holds the ack callback for one in-flight record until the delivery outcome is known. The
/// callback is taken under a lock because the delivery hook receives the opaque by value but the
/// callback itself is consume-once.
pub struct DeliveryAck {
    /// The pending callback. Present until the delivery outcome arrives.
    ack: Mutex<Option<AckCallback>>,
}

impl DeliveryAck {
    /// Wraps an ack callback for use as a delivery opaque.
    fn new(ack: AckCallback) -> Self {
        Self {
            ack: Mutex::new(Some(ack)),
        }
    }
    /// Invokes the callback with the delivery outcome. A second completion is ignored.
    fn complete(&self, outcome: Result<(), ProducerError>) {
        if let Some(ack) = self.ack.lock().take() {
            ack(outcome);
        }
    }
}

/// Producer context that forwards librdkafka logs to tracing and routes delivery reports to the
/// ack callback carried on each record.
struct MirrorProducerContext;

impl ClientContext for MirrorProducerContext {
    /// Routes log lines from the native client to the tracing subscriber.
    fn log(&self, level: RDKafkaLogLevel, facility: &str, message: &str) {
        util::forward_client_log(level, facility, message);
    }
}

impl ProducerContext for MirrorProducerContext {
    type DeliveryOpaque = Box<DeliveryAck>;

    /// Invoked on the producer's polling thread with the terminal outcome of one delivery.
    /// Client-internal retries have already happened by the time this fires.
    fn delivery(
        &self,
        delivery_result: &DeliveryResult<'_>,
        delivery_opaque: Self::DeliveryOpaque,
    ) {
        match delivery_result {
            Ok(_) => delivery_opaque.complete(Ok(())),
            Err((e, _)) => delivery_opaque.complete(Err(ProducerError::Rejected(e.to_string()))),
        }
    }
}

/// Producer handle for a partitioned log destination, backed by an [`rdkafka`] threaded
/// producer. Acknowledgements are dispatched from the producer's own polling thread.
pub struct KafkaProducerHandle {
    /// The underlying producer.
    producer: ThreadedProducer<MirrorProducerContext>,
}

impl KafkaProducerHandle {
    /// Creates a new [`KafkaProducerHandle`] connected to the given brokers. Additional producer
    /// properties are applied on top of the defaults.
    pub fn new(
        bootstrap_servers: impl AsRef<str>,
        properties: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut client_config = ClientConfig::new();

        // apply default config
        client_config.set("bootstrap.servers", bootstrap_servers.as_ref());

        // apply user config
        client_config.extend(properties);

        if tracing::enabled!(tracing::Level::DEBUG) {
            for (key, value) in client_config.config_map().iter() {
                tracing::debug!("destination producer configured with {}={}", key, value);
            }
        }

        let producer: ThreadedProducer<MirrorProducerContext> = client_config
            .set_log_level(RDKafkaLogLevel::Debug)
            .create_with_context(MirrorProducerContext)
            .context("create Kafka producer")?;

        Ok(Self { producer })
    }
}

impl ProducerHandle for KafkaProducerHandle {
    /// Schedules delivery of the record. The envelope metadata travels as record headers so the
    /// destination retains the origin coordinates. A full queue is retried with a short backoff
    /// before the error is surfaced.
    fn send(&self, record: ProducerRecord, ack: AckCallback) -> Result<(), ProducerError> {
        let mut headers = OwnedHeaders::new();

        if let Some(hs) = record.envelope.headers.as_ref() {
            for (key, value) in hs {
                headers = headers.insert(Header {
                    key,
                    value: Some(value.as_slice()),
                });
            }
        }

        for (key, value) in &record.envelope.metadata {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }

        let opaque = Box::new(DeliveryAck::new(ack));

        let mut base: BaseRecord<'_, [u8], [u8], Box<DeliveryAck>> =
            BaseRecord::with_opaque_to(&record.topic, opaque)
                .timestamp(record.events_source_timestamp)
                .headers(headers);

        if let Some(key) = record.envelope.key.as_deref() {
            base = base.key(key);
        }

        if let Some(value) = record.envelope.value.as_deref() {
            base = base.payload(value);
        }

        if let Some(partition) = record.partition {
            base = base.partition(partition);
        }

        let mut attempt = 0;

        loop {
            match self.producer.send(base) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    attempt += 1;

                    if attempt >= SUBMIT_ATTEMPTS {
                        return Err(ProducerError::QueueFull);
                    }

                    tracing::debug!(
                        "producer queue full, retrying submit (attempt {})",
                        attempt
                    );

                    std::thread::sleep(SUBMIT_BACKOFF);
                    base = returned;
                }
                Err((e, _)) => return Err(ProducerError::Transient(e.to_string())),
            }
        }
    }
    /// Blocks until every previously submitted record has been terminally acknowledged, or the
    /// timeout elapses.
    fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer.flush(timeout).map_err(|e| match e {
            KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut) => {
                ProducerError::FlushTimeout(timeout)
            }
            _ => ProducerError::Transient(e.to_string()),
        })
    }
}
