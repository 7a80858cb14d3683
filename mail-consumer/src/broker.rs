use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::error::BrokerError;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// One message as pulled off the broker, payload not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// Messages fetched together by one instance in one cycle.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    topic: String,
    messages: Vec<RawMessage>,
}

impl Batch {
    pub fn new(topic: impl Into<String>, messages: Vec<RawMessage>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn messages(&self) -> &[RawMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Lowest and highest offset seen per partition.
    pub fn offset_range(&self) -> BTreeMap<i32, (i64, i64)> {
        let mut ranges: BTreeMap<i32, (i64, i64)> = BTreeMap::new();
        for message in &self.messages {
            ranges
                .entry(message.partition)
                .and_modify(|(first, last)| {
                    *first = (*first).min(message.offset);
                    *last = (*last).max(message.offset);
                })
                .or_insert((message.offset, message.offset));
        }
        ranges
    }
}

/// Broker capability owned exclusively by one consumer instance.
///
/// `fetch` is raced against the instance's wake signal, so dropping it
/// before completion must be safe. That only happens once the instance is
/// stopping and will never commit again.
#[async_trait]
pub trait Broker: Send + Sync {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Wait at most `timeout` for up to `max_messages`. An empty batch is not an error.
    async fn fetch(&mut self, timeout: Duration, max_messages: usize)
        -> Result<Batch, BrokerError>;

    /// Synchronously advance the checkpoint past every message of `batch`.
    fn commit(&mut self, batch: &Batch) -> Result<(), BrokerError>;

    /// Move the fetch position back to the start of `batch` so it is delivered again.
    fn rewind(&mut self, batch: &Batch) -> Result<(), BrokerError>;

    /// Release the client. Further calls fail.
    fn close(&mut self);
}

pub struct KafkaBroker {
    consumer: Option<StreamConsumer>,
    topic: String,
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig, group_id: &str) -> Result<Self, BrokerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", group_id)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            // Offsets only move when a whole batch succeeded
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;

        Ok(Self {
            consumer: Some(consumer),
            topic: String::new(),
        })
    }

    fn consumer(&self) -> Result<&StreamConsumer, BrokerError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Disconnected("consumer already closed".to_owned()))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.consumer()?.subscribe(&[topic])?;
        self.topic = topic.to_owned();
        Ok(())
    }

    async fn fetch(
        &mut self,
        timeout: Duration,
        max_messages: usize,
    ) -> Result<Batch, BrokerError> {
        let consumer = self.consumer()?;
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::with_capacity(max_messages);

        while messages.len() < max_messages {
            match tokio::time::timeout_at(deadline, consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(message)) => messages.push(RawMessage {
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec),
                }),
                Ok(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(partition, "reached end of partition");
                }
                Ok(Err(e)) if messages.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    // The consumer position already moved past what we hold, hand it over
                    warn!("kafka error after {} messages, returning partial batch: {e}", messages.len());
                    break;
                }
            }
        }

        Ok(Batch::new(self.topic.clone(), messages))
    }

    fn commit(&mut self, batch: &Batch) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;

        let mut list = TopicPartitionList::new();
        for (partition, (_, last)) in batch.offset_range() {
            list.add_partition_offset(batch.topic(), partition, Offset::Offset(last + 1))?;
        }
        if list.count() == 0 {
            return Ok(());
        }

        consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    fn rewind(&mut self, batch: &Batch) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;

        for (partition, (first, _)) in batch.offset_range() {
            consumer.seek(batch.topic(), partition, Offset::Offset(first), SEEK_TIMEOUT)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(partition: i32, offset: i64) -> RawMessage {
        RawMessage {
            partition,
            offset,
            payload: None,
        }
    }

    #[test]
    fn offset_range_spans_each_partition() {
        let batch = Batch::new(
            "high-priority-mails",
            vec![message(0, 12), message(1, 3), message(0, 10), message(0, 11)],
        );

        let ranges = batch.offset_range();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[&0], (10, 12));
        assert_eq!(ranges[&1], (3, 3));
        assert!(Batch::default().offset_range().is_empty());
    }

    #[tokio::test]
    async fn closed_broker_refuses_calls() {
        let config = KafkaConfig {
            kafka_hosts: "localhost:9092".to_owned(),
            kafka_tls: false,
            kafka_consumer_offset_reset: "earliest".to_owned(),
        };
        let mut broker = KafkaBroker::new(&config, "test-group").expect("client creation");

        broker.close();
        // closing twice is harmless
        broker.close();

        let batch = Batch::new("t", vec![message(0, 1)]);
        assert!(matches!(
            broker.commit(&batch),
            Err(BrokerError::Disconnected(_))
        ));
        assert!(matches!(
            broker.fetch(Duration::from_millis(10), 10).await,
            Err(BrokerError::Disconnected(_))
        ));
        assert!(matches!(
            broker.subscribe("t"),
            Err(BrokerError::Disconnected(_))
        ));
    }
}
