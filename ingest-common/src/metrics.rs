use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Serve `router` on `bind` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Add a `/metrics` route rendering everything recorded through `handle` to `router`.
pub fn setup_metrics_routes(router: Router, handle: PrometheusHandle) -> Router {
    router.route("/metrics", get(move || std::future::ready(handle.render())))
}

/// Install the global Prometheus recorder. Only one recorder may exist per process.
/// Processing durations are recorded in seconds, hence the buckets.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}
