//! Publishing of domain events to the broker, the producing side of `IngestConsumer`.
use async_trait::async_trait;
use ingest_common::error::{ClassifiedError, ErrorCode};
use ingest_common::messages::OutgoingMessage;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::metric_consts::EVENTS_PUBLISHED;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one message and wait for the broker to acknowledge it.
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), ClassifiedError>;

    /// Publish `messages`, returning one result per message in the order given.
    async fn publish_batch(&self, messages: &[OutgoingMessage]) -> Vec<Result<(), ClassifiedError>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.publish(message).await);
        }
        results
    }
}

/// An `EventPublisher` producing to a single Kafka topic.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventPublisher {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", config.kafka_compression_codec.to_owned());

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        Ok(Self {
            producer,
            topic: topic.to_owned(),
        })
    }

    fn record<'a>(&'a self, message: &'a OutgoingMessage) -> FutureRecord<'a, String, String> {
        FutureRecord::to(&self.topic)
            .key(&message.key)
            .payload(&message.payload)
    }
}

/// The broker being unreachable or overloaded is transient, so every produce failure is retryable.
fn produce_failed(message: &OutgoingMessage, error: Option<KafkaError>) -> ClassifiedError {
    let classified = ClassifiedError::retryable(
        ErrorCode::ConnectivityError,
        match &error {
            Some(error) => format!("failed to produce to kafka: {error}"),
            None => "failed to produce to kafka (canceled)".to_owned(),
        },
    )
    .with_context("message_type", message.message_type)
    .with_context("trace_id", message.trace_id.to_string());

    match error {
        Some(error) => classified.with_cause(error),
        None => classified,
    }
}

fn record_outcome(message: &OutgoingMessage, result: &Result<(), ClassifiedError>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    metrics::counter!(
        EVENTS_PUBLISHED,
        "message_type" => message.message_type,
        "outcome" => outcome
    )
    .increment(1);

    if let Err(error) = result {
        warn!(
            message_type = message.message_type,
            trace_id = %message.trace_id,
            error = %error,
            "failed to publish event"
        );
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), ClassifiedError> {
        let result = match self.producer.send_result(self.record(message)) {
            Err((error, _)) => Err(produce_failed(message, Some(error))),
            Ok(delivery) => match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((error, _))) => Err(produce_failed(message, Some(error))),
                Err(_) => Err(produce_failed(message, None)),
            },
        };

        record_outcome(message, &result);
        result
    }

    /// Enqueue every message before waiting for any acknowledgement, so the batch is produced in
    /// one go.
    async fn publish_batch(&self, messages: &[OutgoingMessage]) -> Vec<Result<(), ClassifiedError>> {
        let enqueued: Vec<_> = messages
            .iter()
            .map(|message| {
                self.producer
                    .send_result(self.record(message))
                    .map_err(|(error, _)| error)
            })
            .collect();

        let mut results = Vec::with_capacity(messages.len());
        for (message, enqueued) in messages.iter().zip(enqueued) {
            let result = match enqueued {
                Err(error) => Err(produce_failed(message, Some(error))),
                Ok(delivery) => match delivery.await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err((error, _))) => Err(produce_failed(message, Some(error))),
                    Err(_) => Err(produce_failed(message, None)),
                },
            };
            record_outcome(message, &result);
            results.push(result);
        }
        results
    }
}

/// An `EventPublisher` collecting messages in process memory.
#[derive(Default)]
pub struct MemoryEventPublisher {
    published: Mutex<Vec<OutgoingMessage>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, oldest first.
    pub async fn published(&self) -> Vec<OutgoingMessage> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), ClassifiedError> {
        self.published.lock().await.push(message.clone());
        record_outcome(message, &Ok(()));
        Ok(())
    }
}
