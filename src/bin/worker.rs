use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use splat_forge::app_state::Backends;
use splat_forge::config::AppConfig;
use splat_forge::routes::metrics::describe_metrics;
use splat_forge::services::delivery::DeliveryLoop;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting splat generation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = config.worker_metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        describe_metrics();
        tracing::info!(%addr, "Worker metrics listener started");
    }

    let pool_size = config.worker_concurrency as u32 + 1;
    let backends = Backends::connect(&config, pool_size, false)
        .await
        .expect("Failed to connect backends");

    tokio::fs::create_dir_all(config.scratch_dir())
        .await
        .expect("Failed to create scratch directory");

    if !backends.generator.health_check().await {
        tracing::warn!(generator_url = %config.generator_url, "Generation service not ready; jobs will retry");
    }

    let queue = backends.generation_queue();
    match queue.recover_abandoned().await {
        Ok(0) => {}
        Ok(recovered) => tracing::warn!(recovered, "Re-queued jobs abandoned by a previous worker"),
        Err(e) => tracing::error!(error = %e, "Failed to recover abandoned jobs"),
    }

    let delivery = Arc::new(DeliveryLoop::new(
        queue,
        Arc::new(backends.worker(&config)),
        config.max_attempts,
        config.poll_interval(),
        config.worker_concurrency,
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing running jobs");
        }
        shutdown.cancel();
    });

    tracing::info!("Worker ready, starting job processing loop");
    delivery.run(cancel).await;
    tracing::info!("Worker stopped");
}
