use std::sync::Arc;

use crate::models::image::ImageId;
use crate::models::status::StatusResponse;
use crate::services::artifacts::{ArtifactError, ArtifactStore};
use crate::services::render::ViewerRenderer;
use crate::services::tracker::{JobStateTracker, TrackerError};

/// Answers "is the splat for this image ready yet?".
///
/// Precedence: an existing artifact wins, then a live in-progress marker,
/// then a recorded terminal failure, otherwise `pending`. Queued and never
/// requested both read as `pending`.
pub struct StatusQuery {
    artifacts: Arc<ArtifactStore>,
    tracker: Arc<dyn JobStateTracker>,
    renderer: Arc<dyn ViewerRenderer>,
    failure_message: String,
}

impl StatusQuery {
    pub fn new(
        artifacts: Arc<ArtifactStore>,
        tracker: Arc<dyn JobStateTracker>,
        renderer: Arc<dyn ViewerRenderer>,
        failure_message: impl Into<String>,
    ) -> Self {
        Self {
            artifacts,
            tracker,
            renderer,
            failure_message: failure_message.into(),
        }
    }

    pub async fn status(&self, image_id: &ImageId) -> Result<StatusResponse, StatusError> {
        if let Some(artifact) = self.artifacts.lookup(image_id).await? {
            let splat_url = self.artifacts.public_url(&artifact);
            let viewer_html = self.renderer.render(&artifact, &splat_url);
            return Ok(StatusResponse::Complete {
                artifact_uri: artifact.uri,
                splat_url,
                viewer_html,
            });
        }

        if self.tracker.is_in_progress(image_id).await? {
            return Ok(StatusResponse::Processing);
        }

        if let Some(failure) = self.tracker.failure(image_id).await? {
            tracing::debug!(image_id = %image_id, reason = %failure.message, "Reporting recorded failure");
            return Ok(StatusResponse::Failed {
                message: self.failure_message.clone(),
            });
        }

        Ok(StatusResponse::Pending)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{ArtifactFormat, GenerationOptions};
    use crate::services::catalog::MemoryCatalog;
    use crate::services::render::LinkRenderer;
    use crate::services::storage::{LocalObjectStore, ObjectStore};
    use crate::services::tracker::MemoryStateTracker;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        objects: Arc<LocalObjectStore>,
        tracker: Arc<MemoryStateTracker>,
        query: StatusQuery,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LocalObjectStore::new(dir.path(), "http://cdn.test"));
        let tracker = Arc::new(MemoryStateTracker::new());
        let artifacts = Arc::new(ArtifactStore::new(
            objects.clone(),
            Arc::new(MemoryCatalog::new()),
            ArtifactFormat::Compressed,
        ));
        let query = StatusQuery::new(artifacts, tracker.clone(), Arc::new(LinkRenderer), "Generation failed.");
        Fixture {
            _dir: dir,
            objects,
            tracker,
            query,
        }
    }

    fn id() -> ImageId {
        ImageId::parse("42").unwrap()
    }

    #[tokio::test]
    async fn test_never_requested_is_pending() {
        let f = fixture();
        assert_eq!(f.query.status(&id()).await.unwrap(), StatusResponse::Pending);
    }

    #[tokio::test]
    async fn test_queued_reads_as_pending() {
        let f = fixture();
        f.tracker.mark_queued(&id()).await.unwrap();
        assert_eq!(f.query.status(&id()).await.unwrap(), StatusResponse::Pending);
    }

    #[tokio::test]
    async fn test_precedence() {
        let f = fixture();
        f.tracker.mark_failed(&id(), "download failed").await.unwrap();
        assert_eq!(
            f.query.status(&id()).await.unwrap(),
            StatusResponse::Failed {
                message: "Generation failed.".to_string()
            }
        );

        f.tracker.mark_in_progress(&id(), &GenerationOptions::default(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(f.query.status(&id()).await.unwrap(), StatusResponse::Processing);

        f.objects.put("splats/42.sog", b"splat", "application/octet-stream").await.unwrap();
        match f.query.status(&id()).await.unwrap() {
            StatusResponse::Complete {
                artifact_uri,
                splat_url,
                viewer_html,
            } => {
                assert_eq!(artifact_uri, "splats/42.sog");
                assert_eq!(splat_url, "http://cdn.test/splats/42.sog");
                assert!(viewer_html.contains("splat-link"));
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }
}
