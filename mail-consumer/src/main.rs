//! Consume HIGH and LOW priority mail jobs from Kafka and send them over SMTP.
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mail_consumer::broker::KafkaBroker;
use mail_consumer::config::Config;
use mail_consumer::metrics::{serve, setup_metrics_router};
use mail_consumer::service::{MailConsumerService, ServiceSettings};
use mail_consumer::shutdown::wait_for_shutdown_signal;
use mail_consumer::transport::SmtpTransport;

pub async fn index() -> &'static str {
    "mail consumer"
}

fn start_server(
    config: &Config,
    liveness: HealthRegistry,
    shutting_down: CancellationToken,
) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || {
                let shutting_down = shutting_down.clone();
                async move {
                    if shutting_down.is_cancelled() {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        )
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .merge(setup_metrics_router().context("Failed to install the Prometheus recorder")?);

    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics and probes on {bind}: {e}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().context("Invalid configuration")?;
    let classes = config.priority_classes();
    for class in &classes {
        info!(
            priority = %class.priority,
            topic = %class.topic,
            group = %class.group,
            instances = class.instances,
            workers = class.workers.get(),
            "Configured priority class"
        );
    }

    let transport = Arc::new(
        SmtpTransport::new(&config.smtp).context("Failed to set up the SMTP transport")?,
    );
    let liveness = HealthRegistry::new("consumers");
    let shutting_down = CancellationToken::new();

    let server_handle = start_server(&config, liveness.clone(), shutting_down.clone())?;
    info!("Serving metrics and probes on {}", config.bind());

    let service = MailConsumerService::start(
        &classes,
        ServiceSettings::from(&config),
        transport,
        &liveness,
        |class, _index| KafkaBroker::new(&config.kafka, &class.group),
    )
    .await
    .context("Failed to start consumer instances")?;
    info!(
        "Started {} consumer instances",
        service.registry().len()
    );

    wait_for_shutdown_signal().await;
    shutting_down.cancel();
    info!("Stopping consumers...");

    let report = service.shutdown().await;
    if report.is_clean() {
        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "All consumers stopped"
        );
    } else {
        error!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            forced = report.forced.len(),
            "Shutdown had to force-cancel work: {:?}",
            report.pools
        );
    }

    server_handle.abort();
    info!("Bye!");

    Ok(())
}
