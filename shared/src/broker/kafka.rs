use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message as KafkaMessage;
use tracing::{error, info, warn};

use super::{ConsumeResult, Message, MessageHandler, Publisher};
use crate::error::{ServiceError, ServiceResult};

pub fn producer(brokers: &str) -> anyhow::Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()?;
    Ok(producer)
}

/// Consumer that commits offsets by hand, only after a handler succeeded.
pub fn consumer(brokers: &str, group_id: &str, topics: &[&str]) -> anyhow::Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;
    consumer.subscribe(topics)?;
    Ok(consumer)
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, message: &Message) -> ServiceResult<()> {
        let json = serde_json::to_string(&message.payload)
            .map_err(|e| ServiceError::FatalDb(format!("failed to encode payload: {}", e)))?;
        let record = FutureRecord::to(&message.topic)
            .payload(&json)
            .key(&message.key);

        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| ServiceError::BrokerUnavailable(format!("Failed to publish: {}", e)))?;

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
    pub backoff: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 16,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Drives a [`MessageHandler`] from a Kafka consumer group.
///
/// `RetryLater` redelivers the same record with linear backoff; once the
/// policy is exhausted the record goes to `<topic>.dlq` and is committed.
pub struct KafkaSubscriber {
    consumer: StreamConsumer,
    dead_letters: Arc<dyn Publisher>,
    policy: RedeliveryPolicy,
}

impl KafkaSubscriber {
    pub fn new(consumer: StreamConsumer, dead_letters: Arc<dyn Publisher>, policy: RedeliveryPolicy) -> Self {
        Self {
            consumer,
            dead_letters,
            policy,
        }
    }

    pub async fn run(&self, handler: Arc<dyn MessageHandler>) {
        let mut message_stream = self.consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    match decode(&m) {
                        Ok(decoded) => self.deliver(handler.as_ref(), &decoded).await,
                        Err(e) => error!(topic = m.topic(), offset = m.offset(), "Discarding undecodable message: {}", e),
                    }
                    if let Err(e) = self.consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn deliver(&self, handler: &dyn MessageHandler, message: &Message) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if handler.handle(message).await == ConsumeResult::Success {
                return;
            }
            if attempt > self.policy.max_redeliveries {
                break;
            }
            warn!(topic = %message.topic, key = %message.key, attempt, "Handler asked for redelivery");
            tokio::time::sleep(self.policy.backoff * attempt).await;
        }

        let dead_letter = Message {
            topic: format!("{}.dlq", message.topic),
            key: message.key.clone(),
            payload: message.payload.clone(),
        };
        match self.dead_letters.publish(&dead_letter).await {
            Ok(()) => info!(topic = %dead_letter.topic, key = %message.key, "Moved message to dead-letter topic"),
            Err(e) => error!(key = %message.key, "Failed to dead-letter message: {}", e),
        }
    }
}

fn decode(m: &BorrowedMessage<'_>) -> ServiceResult<Message> {
    let payload = match m.payload_view::<str>() {
        Some(Ok(json_str)) => serde_json::from_str(json_str)
            .map_err(|e| ServiceError::InvalidArgument(format!("payload is not json: {}", e)))?,
        Some(Err(e)) => return Err(ServiceError::InvalidArgument(format!("payload is not utf-8: {}", e))),
        None => return Err(ServiceError::InvalidArgument("empty payload".to_string())),
    };
    let key = m
        .key_view::<str>()
        .and_then(|k| k.ok())
        .unwrap_or_default()
        .to_string();

    Ok(Message {
        topic: m.topic().to_string(),
        key,
        payload,
    })
}
