//! Consumer side of the generation queue.
//!
//! Pops deliveries, runs them through [`GenerationWorker`], and settles the
//! outcome: acknowledge on success, re-push with a bumped attempt count on a
//! retryable failure, otherwise record a durable failure marker and drop the
//! job. A job deferred behind a running generation is re-pushed unchanged.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::services::queue::{Delivery, GenerationQueue, QueueError};
use crate::services::worker::{GenerationWorker, JobError, JobOutcome};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Skipped,
    Deferred,
    Retried,
    Discarded,
}

pub struct DeliveryLoop {
    queue: Arc<GenerationQueue>,
    worker: Arc<GenerationWorker>,
    max_attempts: u32,
    poll_interval: Duration,
    concurrency: usize,
}

impl DeliveryLoop {
    pub fn new(
        queue: Arc<GenerationQueue>,
        worker: Arc<GenerationWorker>,
        max_attempts: u32,
        poll_interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            worker,
            max_attempts: max_attempts.max(1),
            poll_interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Run `concurrency` consumers until `cancel` fires. A consumer finishes
    /// the job it holds before stopping.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            concurrency = self.concurrency,
            max_attempts = self.max_attempts,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Delivery loop started"
        );

        let mut consumers = JoinSet::new();
        for consumer in 0..self.concurrency {
            let this = self.clone();
            let cancel = cancel.clone();
            consumers.spawn(async move { this.consume(consumer, cancel).await });
        }

        while let Some(joined) = consumers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Consumer task aborted");
            }
        }
        tracing::info!("Delivery loop stopped");
    }

    async fn consume(&self, consumer: usize, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            // A deferred job comes straight back; wait before taking it again.
            let idle = match self.handle_next().await {
                Ok(Some(Settlement::Deferred)) => true,
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(consumer, error = %e, "Failed to take next job, will retry");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        tracing::debug!(consumer, "Consumer shutting down");
    }

    /// Take one delivery and process it. `Ok(None)` when the queue is empty.
    pub async fn handle_next(&self) -> Result<Option<Settlement>, QueueError> {
        let Some(delivery) = self.queue.jobs().pop().await? else {
            return Ok(None);
        };

        if let Ok(depth) = self.queue.jobs().pending_count().await {
            metrics::gauge!("splat_queue_depth").set(depth as f64);
        }

        let result = self.worker.process(&delivery.job).await;
        self.settle(delivery, result).await.map(Some)
    }

    /// Acknowledge, retry, or discard a processed delivery.
    pub async fn settle(
        &self,
        delivery: Delivery,
        result: Result<JobOutcome, JobError>,
    ) -> Result<Settlement, QueueError> {
        let job = &delivery.job;
        let settlement = match result {
            Ok(JobOutcome::Generated(_)) => {
                metrics::counter!("splat_jobs_completed_total").increment(1);
                Settlement::Completed
            }
            Ok(JobOutcome::Skipped) => Settlement::Skipped,
            Ok(JobOutcome::Deferred) => {
                self.queue.requeue(job).await?;
                Settlement::Deferred
            }
            Err(e) if e.is_retryable() && job.attempts + 1 < self.max_attempts => {
                let mut retry = job.clone();
                retry.attempts += 1;
                self.queue.requeue(&retry).await?;
                metrics::counter!("splat_jobs_retried_total").increment(1);
                tracing::info!(
                    image_id = %job.image_id,
                    job_id = %job.job_id,
                    attempt = retry.attempts,
                    max_attempts = self.max_attempts,
                    error = %e,
                    "Job re-queued for retry"
                );
                Settlement::Retried
            }
            Err(e) => {
                let message = format!("{e}");
                self.worker.tracker().mark_failed(&job.image_id, &message).await?;
                metrics::counter!("splat_jobs_failed_total", "kind" => e.kind()).increment(1);
                tracing::warn!(
                    image_id = %job.image_id,
                    job_id = %job.job_id,
                    attempts = job.attempts + 1,
                    error = %e,
                    "Job discarded"
                );
                Settlement::Discarded
            }
        };

        self.queue.jobs().ack(&delivery).await?;
        Ok(settlement)
    }
}
