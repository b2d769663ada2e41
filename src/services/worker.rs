use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::artifact::Artifact;
use crate::models::image::ImageId;
use crate::models::job::GenerationOptions;
use crate::services::artifacts::{ArtifactError, ArtifactStore};
use crate::services::catalog::Catalog;
use crate::services::generator::{GenerationClient, GenerationError};
use crate::services::queue::QueuedJob;
use crate::services::storage::{ObjectStore, StorageError};
use crate::services::tracker::{JobStateTracker, TrackerError};

/// Result of one successful worker execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Generated(Artifact),
    /// Another execution with the same options holds the image; this
    /// delivery did nothing.
    Skipped,
    /// Another execution with different options holds the image; the job
    /// must run again once it finishes.
    Deferred,
}

/// Why a worker execution failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Source image not found: {0}")]
    NotFound(String),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Saving splat failed: {0}")]
    Storage(String),

    #[error("Job state tracker unavailable: {0}")]
    Tracker(#[from] TrackerError),
}

impl JobError {
    /// A missing source will not reappear on retry; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::NotFound(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "not_found",
            JobError::Generation(_) => "generation",
            JobError::Download(_) => "download",
            JobError::Storage(_) => "storage",
            JobError::Tracker(_) => "tracker",
        }
    }
}

impl From<ArtifactError> for JobError {
    fn from(e: ArtifactError) -> Self {
        JobError::Storage(e.to_string())
    }
}

/// Holds an image's in-progress marker for one execution.
///
/// Call [`InProgressGuard::release`] on every path. If the guard is dropped
/// unreleased (panic, cancelled future) the marker is removed from a
/// spawned task instead.
pub struct InProgressGuard {
    tracker: Arc<dyn JobStateTracker>,
    image_id: ImageId,
    released: bool,
}

impl InProgressGuard {
    /// Returns `None` when another execution already holds the image.
    pub async fn acquire(
        tracker: Arc<dyn JobStateTracker>,
        image_id: &ImageId,
        options: &GenerationOptions,
        lease: Duration,
    ) -> Result<Option<Self>, TrackerError> {
        if !tracker.mark_in_progress(image_id, options, lease).await? {
            return Ok(None);
        }
        Ok(Some(Self {
            tracker,
            image_id: image_id.clone(),
            released: false,
        }))
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.tracker.unmark_in_progress(&self.image_id).await {
            // The lease still expires on its own.
            tracing::error!(image_id = %self.image_id, error = %e, "Failed to clear in-progress marker");
        }
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let tracker = self.tracker.clone();
        let image_id = self.image_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tracker.unmark_in_progress(&image_id).await {
                        tracing::error!(image_id = %image_id, error = %e, "Failed to clear in-progress marker");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(image_id = %image_id, "No runtime to clear in-progress marker; lease will expire");
            }
        }
    }
}

/// Settings for [`GenerationWorker`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub generation_timeout: Duration,
    pub in_progress_lease: Duration,
    /// 0 disables the limit.
    pub max_image_bytes: u64,
    pub scratch_dir: PathBuf,
}

/// Runs one delivered job through generate, download, and save.
pub struct GenerationWorker {
    tracker: Arc<dyn JobStateTracker>,
    catalog: Arc<dyn Catalog>,
    objects: Arc<dyn ObjectStore>,
    generator: Arc<dyn GenerationClient>,
    artifacts: Arc<ArtifactStore>,
    settings: WorkerSettings,
}

impl GenerationWorker {
    pub fn new(
        tracker: Arc<dyn JobStateTracker>,
        catalog: Arc<dyn Catalog>,
        objects: Arc<dyn ObjectStore>,
        generator: Arc<dyn GenerationClient>,
        artifacts: Arc<ArtifactStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            tracker,
            catalog,
            objects,
            generator,
            artifacts,
            settings,
        }
    }

    pub fn tracker(&self) -> &Arc<dyn JobStateTracker> {
        &self.tracker
    }

    /// Per-job entry point. The in-progress marker is cleared before this
    /// returns, whatever the outcome.
    pub async fn process(&self, job: &QueuedJob) -> Result<JobOutcome, JobError> {
        let image_id = &job.image_id;

        self.tracker.unmark_queued(image_id).await?;
        let acquired = InProgressGuard::acquire(
            self.tracker.clone(),
            image_id,
            &job.options,
            self.settings.in_progress_lease,
        )
        .await?;
        let Some(guard) = acquired else {
            return self.busy(job).await;
        };

        tracing::info!(image_id = %image_id, job_id = %job.job_id, attempt = job.attempts + 1, "Processing splat generation");
        let start = Instant::now();
        let result = self.generate(job).await;
        guard.release().await;

        match &result {
            Ok(JobOutcome::Generated(artifact)) => {
                metrics::histogram!("splat_generation_seconds").record(start.elapsed().as_secs_f64());
                tracing::info!(
                    image_id = %image_id,
                    job_id = %job.job_id,
                    uri = %artifact.uri,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Generated and saved splat"
                );
            }
            Ok(JobOutcome::Skipped | JobOutcome::Deferred) => {}
            Err(e) => {
                tracing::error!(
                    image_id = %image_id,
                    job_id = %job.job_id,
                    kind = e.kind(),
                    error = %e,
                    "Error processing splat generation"
                );
            }
        }
        result
    }

    /// Another execution holds the image. Identical options mean it is
    /// already producing this job's artifact.
    async fn busy(&self, job: &QueuedJob) -> Result<JobOutcome, JobError> {
        let running = self.tracker.running_options(&job.image_id).await?;
        if running.as_ref() == Some(&job.options) {
            tracing::warn!(
                image_id = %job.image_id,
                job_id = %job.job_id,
                "Generation already running for image, skipping duplicate job"
            );
            metrics::counter!("splat_jobs_skipped_total").increment(1);
            return Ok(JobOutcome::Skipped);
        }

        tracing::info!(
            image_id = %job.image_id,
            job_id = %job.job_id,
            "Generation with other options running for image, deferring job"
        );
        metrics::counter!("splat_jobs_deferred_total").increment(1);
        Ok(JobOutcome::Deferred)
    }

    async fn generate(&self, job: &QueuedJob) -> Result<JobOutcome, JobError> {
        let image_id = &job.image_id;

        let image = self
            .catalog
            .source_image(image_id)
            .await
            .map_err(|e| JobError::Storage(format!("catalog unavailable: {e}")))?
            .ok_or_else(|| JobError::NotFound(format!("image {image_id} is not in the catalog")))?;

        let image_bytes = match self.objects.get(&image.storage_key).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return Err(JobError::NotFound(format!("image file is empty: {}", image.storage_key))),
            Err(StorageError::NotFound(key)) => {
                return Err(JobError::NotFound(format!("image file not accessible: {key}")))
            }
            // Backend outages are worth retrying; a missing object is not.
            Err(e) => {
                return Err(JobError::Storage(format!(
                    "could not read image file {}: {e}",
                    image.storage_key
                )))
            }
        };

        let size = image_bytes.len() as u64;
        if self.settings.max_image_bytes > 0 && size > self.settings.max_image_bytes {
            return Err(GenerationError::ImageTooLarge {
                size,
                limit: self.settings.max_image_bytes,
            }
            .into());
        }

        tracing::debug!(image_id = %image_id, size, "Submitting image to generation service");
        let reference = self
            .generator
            .generate(&image_bytes, &image.filename, &job.options, self.settings.generation_timeout)
            .await?;

        // Removed when dropped, on success and failure alike.
        let scratch = tempfile::Builder::new()
            .prefix("splat_")
            .tempfile_in(&self.settings.scratch_dir)
            .map_err(|e| JobError::Storage(format!("could not allocate scratch file: {e}")))?
            .into_temp_path();

        if !self.generator.download(&reference, &scratch).await {
            return Err(JobError::Download(format!("could not fetch {}", reference.url)));
        }

        let artifact = self.artifacts.save(&image, &scratch, job.options.format).await?;
        drop(scratch);

        if let Err(e) = self.tracker.clear_failed(image_id).await {
            tracing::warn!(image_id = %image_id, error = %e, "Failed to clear stale failure marker");
        }
        Ok(JobOutcome::Generated(artifact))
    }
}
