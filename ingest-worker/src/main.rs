//! Consume collector observations from Kafka and merge them into the canonical store.
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use ingest_common::dead_letter::PgDeadLetterSink;
use ingest_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use ingest_common::retry::RetryPolicy;
use ingest_common::store::{PgRecordStore, RecordStore};
use ingest_worker::config::{Config, LogFormat};
use ingest_worker::consumer::IngestConsumer;
use ingest_worker::error::WorkerError;
use ingest_worker::handlers::register_default_handlers;
use ingest_worker::pipeline::EventPipeline;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    match format {
        LogFormat::Json => {
            let log_layer = tracing_subscriber::fmt::layer().json().with_filter(filter);
            tracing_subscriber::registry().with(log_layer).init();
        }
        LogFormat::Text => {
            let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
            tracing_subscriber::registry().with(log_layer).init();
        }
    }
}

pub async fn index() -> &'static str {
    "ingest worker"
}

async fn readiness(State(pool): State<PgPool>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => StatusCode::OK,
        Err(error) => {
            warn!(error = %error, "readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn start_health_liveness_server(
    config: &Config,
    pool: PgPool,
    recorder: PrometheusHandle,
) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(index))
        .route("/_readiness", get(readiness))
        .with_state(pool);
    let router = setup_metrics_routes(router, recorder);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(error = %error, bind = %bind, "failed to serve health and metrics endpoints");
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_with_defaults()?;
    setup_tracing(config.log_format);
    info!(worker_name = %config.worker_name, "Starting up...");

    let recorder = setup_metrics_recorder()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await?;

    let profiles: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new_from_pool(
        config.profiles_table.as_str(),
        pool.clone(),
    ));
    let posts: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new_from_pool(
        config.content_posts_table.as_str(),
        pool.clone(),
    ));
    let dead_letters = Arc::new(PgDeadLetterSink::new_from_pool(
        config.dead_letter_table.as_str(),
        pool.clone(),
    ));

    let pipeline = Arc::new(register_default_handlers(
        EventPipeline::new(dead_letters),
        profiles,
        posts,
    ));
    info!(
        message_types = ?pipeline.message_types().collect::<Vec<_>>(),
        "registered handlers"
    );

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let consumer = IngestConsumer::new(&config.kafka, &config.consumer)?;

    start_health_liveness_server(&config, pool, recorder);

    consumer
        .run(pipeline, retry_policy, config.max_concurrent_workers)
        .await
}
