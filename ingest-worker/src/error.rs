use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors related to initialization and running of the ingest worker.
/// Failures of individual messages are `ClassifiedError`s and never surface here.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("failed to connect to the database: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("kafka error: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("worker {0} exited unexpectedly")]
    WorkerGone(usize),
}
