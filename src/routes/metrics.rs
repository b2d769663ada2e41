use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus text exposition of the `splat_*` job metrics.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the API and worker emit.
pub fn describe_metrics() {
    metrics::describe_counter!("splat_jobs_enqueued_total", "Generation jobs pushed to the queue");
    metrics::describe_counter!(
        "splat_jobs_deduplicated_total",
        "Enqueue requests ignored because the image was already queued"
    );
    metrics::describe_counter!("splat_jobs_completed_total", "Jobs that produced a saved splat");
    metrics::describe_counter!("splat_jobs_failed_total", "Jobs discarded after a terminal failure");
    metrics::describe_counter!("splat_jobs_retried_total", "Failed jobs pushed back for another attempt");
    metrics::describe_counter!(
        "splat_jobs_skipped_total",
        "Deliveries skipped because the same generation was already in progress"
    );
    metrics::describe_counter!(
        "splat_jobs_deferred_total",
        "Deliveries pushed back behind a running generation with other options"
    );
    metrics::describe_histogram!(
        "splat_generation_seconds",
        metrics::Unit::Seconds,
        "Time from in-progress to saved splat"
    );
    metrics::describe_gauge!("splat_queue_depth", "Pending jobs in the generation queue");
}
