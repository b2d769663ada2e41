use axum::extract::State;
use axum::Json;

use super::ApiError;
use crate::app_state::AppState;
use crate::models::status::{GeneratorHealthResponse, QueueStats};

/// GET /api/v1/queue/stats: pending jobs and tracker sets.
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.queue.stats().await?))
}

/// GET /api/v1/generator/health: whether the generation service has its
/// model loaded.
pub async fn generator_health(State(state): State<AppState>) -> Json<GeneratorHealthResponse> {
    let healthy = state.generator.health_check().await;
    if !healthy {
        tracing::warn!(generator_url = %state.generator_url, "Generation service unhealthy");
    }
    Json(GeneratorHealthResponse {
        healthy,
        generator_url: state.generator_url.clone(),
    })
}
