use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use super::{resolve_image, ApiError};
use crate::app_state::AppState;
use crate::models::job::GenerationOptions;
use crate::models::status::{EnqueueResponse, GenerateRequest, StatusResponse};
use crate::services::queue::EnqueueOutcome;

/// GET /api/v1/splats/{image_id}/status: poll generation status.
pub async fn get_status(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let image = resolve_image(&state, &image_id).await?;
    let status = state.status.status(&image.id).await?;
    tracing::debug!(image_id = %image.id, status = status.label(), "Status query");
    Ok(Json(status))
}

/// POST /api/v1/splats/{image_id}/generate: queue generation unless one is
/// already waiting.
pub async fn generate(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let image = resolve_image(&state, &image_id).await?;
    let options = parse_options(&body, &state)?;

    let response = match state.queue.enqueue(&image.id, options).await? {
        EnqueueOutcome::Enqueued(job) => EnqueueResponse {
            status: "queued".to_string(),
            image_id: image.id,
            job_id: Some(job.job_id),
        },
        EnqueueOutcome::AlreadyQueued => EnqueueResponse {
            status: "already_queued".to_string(),
            image_id: image.id,
            job_id: None,
        },
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /api/v1/splats/{image_id}/regenerate: delete the existing splat and
/// queue a fresh generation.
pub async fn regenerate(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let image = resolve_image(&state, &image_id).await?;
    let options = parse_options(&body, &state)?;

    let outcome = state
        .queue
        .regenerate(&image.id, options, &state.artifacts)
        .await?;

    tracing::info!(image_id = %image.id, "Regeneration requested");
    let job_id = match outcome {
        EnqueueOutcome::Enqueued(job) => Some(job.job_id),
        EnqueueOutcome::AlreadyQueued => None,
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            status: "queued".to_string(),
            image_id: image.id,
            job_id,
        }),
    ))
}

/// An empty body means defaults. A `format` other than the configured one
/// is rejected.
fn parse_options(body: &[u8], state: &AppState) -> Result<GenerationOptions, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(GenerationOptions::with_format(state.default_format));
    }

    let request: GenerateRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?;
    request
        .validate()
        .map_err(|report| ApiError::BadRequest(report.to_string()))?;

    // Status only looks up the configured format.
    if let Some(format) = request.format.filter(|f| *f != state.default_format) {
        return Err(ApiError::BadRequest(format!(
            "Unsupported format {format}: splats are generated as {}",
            state.default_format
        )));
    }

    Ok(request.into_options(state.default_format))
}
