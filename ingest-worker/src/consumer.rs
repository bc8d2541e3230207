//! Delivery of broker messages to the pipeline.
//!
//! A single receive loop fans messages out to a fixed set of workers by partition, so each
//! partition is processed by one worker, in offset order. An offset is only stored once its
//! message has been resolved (completed or dead-lettered); retryable failures are redelivered in
//! place with backoff, which keeps later offsets of the partition from being committed past it.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ingest_common::codec::Codec;
use ingest_common::retry::RetryPolicy;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    message::{OwnedMessage, Timestamp},
    ClientConfig, Message,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::WorkerError;
use crate::metric_consts::WORKER_QUEUE_DEPTH;
use crate::pipeline::{Delivery, Disposition, EventPipeline};

const WORKER_QUEUE_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct IngestConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

impl IngestConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        client_config.set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Receive messages forever, processing them on `workers` partition-affine tasks.
    pub async fn run<C: Codec + 'static>(
        &self,
        pipeline: Arc<EventPipeline<C>>,
        retry_policy: RetryPolicy,
        workers: usize,
    ) -> Result<(), WorkerError> {
        let workers = workers.max(1);
        let senders: Vec<mpsc::Sender<OwnedMessage>> = (0..workers)
            .map(|index| {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
                tokio::spawn(process_partition_messages(
                    index,
                    self.inner.clone(),
                    pipeline.clone(),
                    retry_policy,
                    rx,
                ));
                tx
            })
            .collect();

        info!(topic = %self.inner.topic, workers, "consuming messages");

        loop {
            let message = match self.inner.consumer.recv().await {
                Ok(message) => message.detach(),
                Err(error) => {
                    // librdkafka recovers from broker errors on its own, keep polling.
                    warn!(error = %error, "failed to receive message");
                    continue;
                }
            };

            let index = worker_for_partition(message.partition(), workers);
            let sender = &senders[index];
            sender
                .send(message)
                .await
                .map_err(|_| WorkerError::WorkerGone(index))?;

            let depth = sender.max_capacity() - sender.capacity();
            metrics::gauge!(WORKER_QUEUE_DEPTH, "worker" => index.to_string()).set(depth as f64);
        }
    }
}

fn worker_for_partition(partition: i32, workers: usize) -> usize {
    usize::try_from(partition).unwrap_or(0) % workers
}

fn broker_timestamp(timestamp: Timestamp) -> Option<DateTime<Utc>> {
    timestamp.to_millis().and_then(DateTime::from_timestamp_millis)
}

async fn process_partition_messages<C: Codec + 'static>(
    index: usize,
    inner: Arc<Inner>,
    pipeline: Arc<EventPipeline<C>>,
    retry_policy: RetryPolicy,
    mut messages: mpsc::Receiver<OwnedMessage>,
) {
    while let Some(message) = messages.recv().await {
        let message_id = format!(
            "{}:{}:{}",
            message.topic(),
            message.partition(),
            message.offset()
        );
        let delivery = Delivery {
            message_id: &message_id,
            payload: message.payload().unwrap_or(&[]),
            timestamp: broker_timestamp(message.timestamp()),
        };

        deliver_until_resolved(&pipeline, delivery, &retry_policy).await;

        if let Err(error) =
            inner
                .consumer
                .store_offset(message.topic(), message.partition(), message.offset())
        {
            error!(worker = index, message_id = %message_id, error = %error, "failed to store offset");
        }
    }

    warn!(worker = index, "worker queue closed");
}

/// Process `delivery` until the pipeline resolves it, waiting between redeliveries as dictated by
/// `retry_policy`.
pub async fn deliver_until_resolved<C: Codec + 'static>(
    pipeline: &EventPipeline<C>,
    delivery: Delivery<'_>,
    retry_policy: &RetryPolicy,
) -> Disposition {
    let mut attempt: u32 = 0;

    loop {
        match pipeline.process(delivery).await {
            Ok(disposition) => return disposition,
            Err(error) => {
                let interval = retry_policy.redelivery_interval(attempt);
                warn!(
                    message_id = delivery.message_id,
                    attempt,
                    error_code = %error.code(),
                    backoff_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                    "redelivering message after backoff"
                );
                tokio::time::sleep(interval).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
