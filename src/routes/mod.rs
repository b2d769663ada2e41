use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::app_state::AppState;
use crate::models::image::{ImageId, SourceImage};
use crate::services::catalog::CatalogError;
use crate::services::queue::{QueueError, RegenerateError};
use crate::services::status::StatusError;

pub mod health;
pub mod metrics;
pub mod queue;
pub mod splats;

/// Every route except `/metrics`, which carries its own state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/splats/{image_id}/status", get(splats::get_status))
        .route("/api/v1/splats/{image_id}/generate", post(splats::generate))
        .route("/api/v1/splats/{image_id}/regenerate", post(splats::regenerate))
        .route("/api/v1/queue/stats", get(queue::queue_stats))
        .route("/api/v1/generator/health", get(queue::generator_health))
        .with_state(state)
}

/// Error returned by HTTP handlers, rendered as
/// `{"status": "error", "message": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Regenerate refused while a generation is running.
    #[error("Generation is already in progress")]
    Processing,

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({"status": "error", "message": msg}),
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({"status": "error", "message": msg}),
            ),
            ApiError::Processing => (
                StatusCode::CONFLICT,
                json!({"status": "processing", "message": self.to_string()}),
            ),
            ApiError::Unavailable(msg) => {
                tracing::error!(error = %msg, "Backend unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({"status": "error", "message": "A backing service is unavailable"}),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"status": "error", "message": "An internal error occurred"}),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl From<StatusError> for ApiError {
    fn from(e: StatusError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<RegenerateError> for ApiError {
    fn from(e: RegenerateError) -> Self {
        match e {
            RegenerateError::InProgress => ApiError::Processing,
            RegenerateError::Artifact(e) => ApiError::Internal(e.to_string()),
            RegenerateError::Queue(e) => e.into(),
        }
    }
}

/// Parse the path segment and confirm the catalog knows the image.
pub(crate) async fn resolve_image(state: &AppState, raw: &str) -> Result<SourceImage, ApiError> {
    let image_id = ImageId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .catalog
        .source_image(&image_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Image {image_id} not found")))
}
