use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};

use crate::{
    Envelope, EventHeaders,
    transport::{RawPayload, Sender},
};

/// Kafka / Redpanda sender.
///
/// Each envelope goes to `topic_prefix + event_type`, keyed by the aggregate
/// id so events of one aggregate stay ordered within a partition. Payloads
/// must already be encoded, so put a [`JsonLayer`](super::layers::JsonLayer)
/// or CloudEvents layer in front of it.
#[derive(Clone)]
pub struct Kafka {
    producer: FutureProducer,
    timeout: Duration,
    topic_prefix: String,
}

impl Kafka {
    /// Default queue timeout is 5 seconds, topic prefix is empty.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
            topic_prefix: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    fn topic(&self, headers: &EventHeaders) -> String {
        format!("{}{}", self.topic_prefix, headers.event_type)
    }
}

fn kafka_headers(headers: &EventHeaders) -> OwnedHeaders {
    let id = headers.id.to_string();
    let attempt = headers.attempt.to_string();
    OwnedHeaders::new()
        .insert(Header {
            key: "id",
            value: Some(id.as_str()),
        })
        .insert(Header {
            key: "event_type",
            value: Some(headers.event_type.as_str()),
        })
        .insert(Header {
            key: "aggregate_type",
            value: Some(headers.aggregate_type.as_str()),
        })
        .insert(Header {
            key: "database",
            value: Some(headers.database.as_str()),
        })
        .insert(Header {
            key: "attempt",
            value: Some(attempt.as_str()),
        })
}

#[async_trait]
impl Sender<EventHeaders, RawPayload> for Kafka {
    type Error = rdkafka::error::KafkaError;

    #[tracing::instrument(skip_all, fields(record_id = %envelope.headers.id))]
    async fn send(&mut self, envelope: Envelope<EventHeaders, RawPayload>) -> Result<(), Self::Error> {
        let topic = self.topic(&envelope.headers);
        let record = FutureRecord::to(&topic)
            .payload(envelope.message.as_bytes())
            .key(envelope.headers.aggregate_id.as_str())
            .headers(kafka_headers(&envelope.headers));

        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;

        tracing::debug!(topic = %topic, partition, offset, "Message delivered to Kafka");
        Ok(())
    }
}
