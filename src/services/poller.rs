//! Timed status poller, the consumer side of the status protocol.
//!
//! Requests status immediately, then every `interval`, until a terminal
//! status arrives, the wall-clock `timeout` elapses, or the caller cancels.
//! Stopping never affects the generation itself.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::image::ImageId;
use crate::models::status::StatusResponse;
use crate::services::status::StatusQuery;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, image_id: &ImageId) -> Result<StatusResponse, PollError>;
}

#[async_trait]
impl StatusSource for StatusQuery {
    async fn fetch_status(&self, image_id: &ImageId) -> Result<StatusResponse, PollError> {
        self.status(image_id)
            .await
            .map_err(|e| PollError::Source(e.to_string()))
    }
}

/// Status endpoint of a running API server.
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self, image_id: &ImageId) -> Result<StatusResponse, PollError> {
        let url = format!("{}/api/v1/splats/{}/status", self.base_url, image_id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PollError::Status {
                code: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// `complete` or `failed` arrived.
    Finished(StatusResponse),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub requests: u32,
}

#[derive(Debug, Clone)]
pub struct StatusPoller {
    interval: Duration,
    timeout: Duration,
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT)
    }
}

impl StatusPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub async fn poll(
        &self,
        source: &dyn StatusSource,
        image_id: &ImageId,
        cancel: &CancellationToken,
    ) -> PollReport {
        let deadline = tokio::time::sleep_until(Instant::now() + self.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests = 0u32;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::Cancelled,
                _ = &mut deadline => break PollOutcome::TimedOut,
                _ = ticker.tick() => {}
            }

            requests += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::Cancelled,
                _ = &mut deadline => break PollOutcome::TimedOut,
                result = source.fetch_status(image_id) => result,
            };

            match result {
                Ok(status) if status.is_terminal() => break PollOutcome::Finished(status),
                Ok(status) => {
                    tracing::debug!(image_id = %image_id, status = status.label(), "Splat not ready yet");
                }
                Err(e) => {
                    tracing::warn!(image_id = %image_id, error = %e, "Status poll failed, continuing");
                }
            }
        };

        if outcome == PollOutcome::TimedOut {
            tracing::info!(
                image_id = %image_id,
                timeout_secs = self.timeout.as_secs(),
                requests,
                "Polling timeout reached"
            );
        }
        PollReport { outcome, requests }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Status endpoint returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Status lookup failed: {0}")]
    Source(String),
}
