use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::image::ImageId;
use crate::models::job::GenerationOptions;
use crate::models::status::QueueStats;
use crate::services::artifacts::{ArtifactError, ArtifactStore};
use crate::services::tracker::{JobStateTracker, TrackerError};

/// Moves ARGV[1] from the processing list (KEYS[1]) back to the consuming
/// end of the pending list (KEYS[2]) if it is still there.
const RESTORE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Job payload serialized into Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub image_id: ImageId,
    #[serde(default)]
    pub options: GenerationOptions,
    pub queued_at: DateTime<Utc>,
    /// Deliveries that already failed.
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedJob {
    pub fn new(image_id: ImageId, options: GenerationOptions) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            image_id,
            options,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// A job handed to one worker execution, plus the receipt used to
/// acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    receipt: String,
}

/// The delivery mechanism: hands each pushed job to at most one consumer.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Move the oldest pending job into the processing set.
    async fn pop(&self) -> Result<Option<Delivery>, QueueError>;

    /// Drop a delivery from the processing set.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Deliveries popped but not yet acknowledged.
    async fn in_flight(&self) -> Result<Vec<Delivery>, QueueError>;

    /// Put an unacknowledged delivery back at the front of the queue.
    /// Returns `false` if it was acknowledged in the meantime.
    async fn restore(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    async fn pending_count(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed list queue with a processing list for in-flight jobs.
pub struct RedisJobQueue {
    client: redis::Client,
    queue_key: String,
    processing_key: String,
    restore: redis::Script,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            queue_key: format!("{key_prefix}:jobs"),
            processing_key: format!("{key_prefix}:processing"),
            restore: redis::Script::new(RESTORE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(&self.queue_key, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;
        let result: Option<String> = conn
            .rpoplpush(&self.queue_key, &self.processing_key)
            .await
            .map_err(QueueError::Redis)?;

        let Some(payload) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedJob>(&payload) {
            Ok(job) => Ok(Some(Delivery { job, receipt: payload })),
            Err(e) => {
                // Unreadable payloads would otherwise sit in the processing list forever.
                conn.lrem::<_, _, ()>(&self.processing_key, 1, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.lrem::<_, _, ()>(&self.processing_key, 1, &delivery.receipt)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn in_flight(&self) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn().await?;
        let payloads: Vec<String> = conn
            .lrange(&self.processing_key, 0, -1)
            .await
            .map_err(QueueError::Redis)?;
        Ok(payloads
            .into_iter()
            .filter_map(|payload| match serde_json::from_str::<QueuedJob>(&payload) {
                Ok(job) => Some(Delivery { job, receipt: payload }),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable in-flight job");
                    None
                }
            })
            .collect())
    }

    async fn restore(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let restored: i32 = self
            .restore
            .key(&self.processing_key)
            .key(&self.queue_key)
            .arg(&delivery.receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(restored == 1)
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.llen(&self.queue_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    pending: VecDeque<QueuedJob>,
    processing: Vec<QueuedJob>,
    pushed: u64,
}

/// In-process FIFO queue.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total jobs ever pushed, retries included.
    pub fn pushed_count(&self) -> u64 {
        self.state().pushed
    }

    pub fn processing_count(&self) -> usize {
        self.state().processing.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut state = self.state();
        state.pending.push_back(job.clone());
        state.pushed += 1;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state();
        let Some(job) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.processing.push(job.clone());
        let receipt = job.job_id.to_string();
        Ok(Some(Delivery { job, receipt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(pos) = state.processing.iter().position(|job| job.job_id == delivery.job.job_id) {
            state.processing.swap_remove(pos);
        }
        Ok(())
    }

    async fn in_flight(&self) -> Result<Vec<Delivery>, QueueError> {
        Ok(self
            .state()
            .processing
            .iter()
            .map(|job| Delivery {
                job: job.clone(),
                receipt: job.job_id.to_string(),
            })
            .collect())
    }

    async fn restore(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut state = self.state();
        let Some(pos) = state.processing.iter().position(|job| job.job_id == delivery.job.job_id) else {
            return Ok(false);
        };
        let job = state.processing.swap_remove(pos);
        state.pending.push_front(job);
        Ok(true)
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(self.state().pending.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued(QueuedJob),
    AlreadyQueued,
}

/// Front door for generation requests: deduplicates against the tracker's
/// `queued` set before handing jobs to the delivery mechanism.
pub struct GenerationQueue {
    jobs: Arc<dyn JobQueue>,
    tracker: Arc<dyn JobStateTracker>,
}

impl GenerationQueue {
    pub fn new(jobs: Arc<dyn JobQueue>, tracker: Arc<dyn JobStateTracker>) -> Self {
        Self { jobs, tracker }
    }

    pub fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.jobs
    }

    /// Queue generation for `image_id` unless a job is already waiting.
    ///
    /// The check and the push are separate operations, so two racing
    /// callers can both enqueue. That costs a redundant generation, nothing
    /// worse.
    pub async fn enqueue(
        &self,
        image_id: &ImageId,
        options: GenerationOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        if self.tracker.is_queued(image_id).await? {
            tracing::info!(image_id = %image_id, "Image already queued for generation");
            metrics::counter!("splat_jobs_deduplicated_total").increment(1);
            return Ok(EnqueueOutcome::AlreadyQueued);
        }

        let job = QueuedJob::new(image_id.clone(), options);
        self.tracker.clear_failed(image_id).await?;

        // Mark before pushing: a worker that pops the job immediately must
        // find the marker to clear.
        self.tracker.mark_queued(image_id).await?;
        if let Err(e) = self.jobs.push(&job).await {
            if let Err(unmark) = self.tracker.unmark_queued(image_id).await {
                tracing::error!(image_id = %image_id, error = %unmark, "Failed to roll back queued marker");
            }
            return Err(e);
        }

        metrics::counter!("splat_jobs_enqueued_total").increment(1);
        tracing::info!(image_id = %image_id, job_id = %job.job_id, format = %job.options.format, "Queued splat generation");
        Ok(EnqueueOutcome::Enqueued(job))
    }

    /// Push a job back for another attempt or a deferred run.
    pub async fn requeue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.tracker.mark_queued(&job.image_id).await?;
        self.jobs.push(job).await
    }

    /// Delete any existing artifact and queue a fresh generation. Refused
    /// while a generation for the image is running.
    pub async fn regenerate(
        &self,
        image_id: &ImageId,
        options: GenerationOptions,
        artifacts: &ArtifactStore,
    ) -> Result<EnqueueOutcome, RegenerateError> {
        if self.tracker.is_in_progress(image_id).await.map_err(QueueError::from)? {
            tracing::warn!(image_id = %image_id, "Regenerate refused while generation is running");
            return Err(RegenerateError::InProgress);
        }

        artifacts.delete(image_id).await?;
        Ok(self.enqueue(image_id, options).await?)
    }

    /// Return jobs a crashed worker popped but never acknowledged. Jobs whose
    /// image holds a live in-progress lease belong to a running execution and
    /// stay where they are.
    pub async fn recover_abandoned(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for delivery in self.jobs.in_flight().await? {
            let image_id = &delivery.job.image_id;
            if self.tracker.is_in_progress(image_id).await? {
                continue;
            }

            self.tracker.mark_queued(image_id).await?;
            if self.jobs.restore(&delivery).await? {
                recovered += 1;
                tracing::warn!(image_id = %image_id, job_id = %delivery.job.job_id, "Recovered abandoned job");
            } else {
                self.tracker.unmark_queued(image_id).await?;
            }
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let pending_count = self.jobs.pending_count().await?;
        metrics::gauge!("splat_queue_depth").set(pending_count as f64);

        Ok(QueueStats {
            pending_count,
            queued_ids: self.tracker.queued_ids().await?,
            in_progress_ids: self.tracker.in_progress_ids().await?,
            failed_ids: self.tracker.failed_ids().await?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, thiserror::Error)]
pub enum RegenerateError {
    #[error("Generation is already in progress")]
    InProgress,

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
