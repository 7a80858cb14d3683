use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// ==== Batch consumption ====
/// Counter for non-empty batches fetched, labelled by topic
pub const BATCHES_FETCHED: &str = "mail_consumer_batches_fetched_total";

/// Histogram for number of raw messages per fetched batch
pub const BATCH_SIZE: &str = "mail_consumer_batch_size";

/// Counter for batches whose checkpoint was committed
pub const BATCHES_COMMITTED: &str = "mail_consumer_batches_committed_total";

/// Counter for batches left uncommitted after a delivery failure
pub const BATCHES_ABSTAINED: &str = "mail_consumer_batches_abstained_total";

/// Counter for failed commit calls
pub const COMMIT_FAILURES: &str = "mail_consumer_commit_failures_total";

/// Counter for broker errors seen while fetching, labelled by fatal/transient
pub const FETCH_ERRORS: &str = "mail_consumer_fetch_errors_total";

// ==== Items ====
/// Counter for malformed messages skipped without delivery
pub const ITEMS_SKIPPED: &str = "mail_consumer_items_skipped_total";

/// Counter for delivery attempts, labelled by status
pub const DELIVERIES: &str = "mail_consumer_deliveries_total";

/// Histogram for createdAt-to-sent latency in milliseconds
pub const DELIVERY_LATENCY_MS: &str = "mail_consumer_delivery_latency_ms";

// ==== Pools and shutdown ====
/// Gauge for delivery tasks currently holding a pool slot, labelled by priority
pub const POOL_IN_FLIGHT: &str = "mail_consumer_pool_in_flight";

/// Counter for instance sets or pools that had to be force-cancelled
pub const FORCED_SHUTDOWNS: &str = "mail_consumer_forced_shutdowns_total";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router exposing the Prometheus `/metrics` endpoint.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const LATENCY_MS: &[f64] = &[
        10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(LATENCY_MS)?
        .install_recorder()
}
