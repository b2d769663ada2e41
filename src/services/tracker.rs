use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::image::ImageId;
use crate::models::job::GenerationOptions;

/// Claims `in_progress` for ARGV[1] unless a live lease (score > now) exists,
/// recording the holder's options in the KEYS[2] hash.
const ACQUIRE_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if score and tonumber(score) > tonumber(ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[4])
return 1
"#;

/// Why an image's last generation was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Lifecycle sets for image ids: `queued`, `in_progress`, and the durable
/// `failed` marker. Every method is a single atomic operation.
#[async_trait]
pub trait JobStateTracker: Send + Sync {
    async fn mark_queued(&self, image_id: &ImageId) -> Result<(), TrackerError>;

    async fn unmark_queued(&self, image_id: &ImageId) -> Result<(), TrackerError>;

    async fn is_queued(&self, image_id: &ImageId) -> Result<bool, TrackerError>;

    /// Claim the image for one execution running with `options`. Returns
    /// `false` when another execution holds an unexpired lease.
    async fn mark_in_progress(
        &self,
        image_id: &ImageId,
        options: &GenerationOptions,
        lease: Duration,
    ) -> Result<bool, TrackerError>;

    async fn unmark_in_progress(&self, image_id: &ImageId) -> Result<(), TrackerError>;

    async fn is_in_progress(&self, image_id: &ImageId) -> Result<bool, TrackerError>;

    /// Options of the execution holding an unexpired lease, if any.
    async fn running_options(&self, image_id: &ImageId) -> Result<Option<GenerationOptions>, TrackerError>;

    async fn mark_failed(&self, image_id: &ImageId, message: &str) -> Result<(), TrackerError>;

    async fn clear_failed(&self, image_id: &ImageId) -> Result<(), TrackerError>;

    async fn failure(&self, image_id: &ImageId) -> Result<Option<FailureRecord>, TrackerError>;

    async fn queued_ids(&self) -> Result<Vec<ImageId>, TrackerError>;

    /// Ids with an unexpired in-progress lease.
    async fn in_progress_ids(&self) -> Result<Vec<ImageId>, TrackerError>;

    async fn failed_ids(&self) -> Result<Vec<ImageId>, TrackerError>;
}

/// Redis-backed tracker shared by the API and every worker process.
pub struct RedisStateTracker {
    client: redis::Client,
    queued_key: String,
    in_progress_key: String,
    running_key: String,
    failed_key: String,
    acquire: redis::Script,
}

impl RedisStateTracker {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self, TrackerError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            queued_key: format!("{key_prefix}:queued"),
            in_progress_key: format!("{key_prefix}:in_progress"),
            running_key: format!("{key_prefix}:in_progress_options"),
            failed_key: format!("{key_prefix}:failed"),
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, TrackerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_ids(raw: Vec<String>) -> Vec<ImageId> {
    raw.into_iter()
        .filter_map(|id| match ImageId::parse(&id) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed id in tracker set");
                None
            }
        })
        .collect()
}

#[async_trait]
impl JobStateTracker for RedisStateTracker {
    async fn mark_queued(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(&self.queued_key, image_id.as_str()).await?;
        Ok(())
    }

    async fn unmark_queued(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        let mut conn = self.conn().await?;
        conn.srem::<_, _, ()>(&self.queued_key, image_id.as_str()).await?;
        Ok(())
    }

    async fn is_queued(&self, image_id: &ImageId) -> Result<bool, TrackerError> {
        let mut conn = self.conn().await?;
        Ok(conn.sismember(&self.queued_key, image_id.as_str()).await?)
    }

    async fn mark_in_progress(
        &self,
        image_id: &ImageId,
        options: &GenerationOptions,
        lease: Duration,
    ) -> Result<bool, TrackerError> {
        let mut conn = self.conn().await?;
        let now = now_ms();
        let deadline = now + lease.as_millis() as i64;
        let payload = serde_json::to_string(options)?;
        let acquired: i32 = self
            .acquire
            .key(&self.in_progress_key)
            .key(&self.running_key)
            .arg(image_id.as_str())
            .arg(now)
            .arg(deadline)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn unmark_in_progress(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .zrem(&self.in_progress_key, image_id.as_str())
            .ignore()
            .hdel(&self.running_key, image_id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_in_progress(&self, image_id: &ImageId) -> Result<bool, TrackerError> {
        let mut conn = self.conn().await?;
        let deadline: Option<f64> = conn.zscore(&self.in_progress_key, image_id.as_str()).await?;
        Ok(deadline.is_some_and(|d| d > now_ms() as f64))
    }

    async fn running_options(&self, image_id: &ImageId) -> Result<Option<GenerationOptions>, TrackerError> {
        let mut conn = self.conn().await?;
        let (deadline, payload): (Option<f64>, Option<String>) = redis::pipe()
            .zscore(&self.in_progress_key, image_id.as_str())
            .hget(&self.running_key, image_id.as_str())
            .query_async(&mut conn)
            .await?;
        if !deadline.is_some_and(|d| d > now_ms() as f64) {
            return Ok(None);
        }
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    async fn mark_failed(&self, image_id: &ImageId, message: &str) -> Result<(), TrackerError> {
        let mut conn = self.conn().await?;
        let record = FailureRecord {
            message: message.to_string(),
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&record)?;
        conn.hset::<_, _, _, ()>(&self.failed_key, image_id.as_str(), payload).await?;
        Ok(())
    }

    async fn clear_failed(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        let mut conn = self.conn().await?;
        conn.hdel::<_, _, ()>(&self.failed_key, image_id.as_str()).await?;
        Ok(())
    }

    async fn failure(&self, image_id: &ImageId) -> Result<Option<FailureRecord>, TrackerError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.hget(&self.failed_key, image_id.as_str()).await?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    async fn queued_ids(&self) -> Result<Vec<ImageId>, TrackerError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(&self.queued_key).await?;
        let mut ids = parse_ids(ids);
        ids.sort();
        Ok(ids)
    }

    async fn in_progress_ids(&self) -> Result<Vec<ImageId>, TrackerError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(&self.in_progress_key, format!("({}", now_ms()), "+inf")
            .await?;
        Ok(parse_ids(ids))
    }

    async fn failed_ids(&self) -> Result<Vec<ImageId>, TrackerError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.hkeys(&self.failed_key).await?;
        let mut ids = parse_ids(ids);
        ids.sort();
        Ok(ids)
    }
}

struct Lease {
    deadline: Instant,
    options: GenerationOptions,
}

#[derive(Default)]
struct MemoryState {
    queued: BTreeSet<ImageId>,
    in_progress: BTreeMap<ImageId, Lease>,
    failed: BTreeMap<ImageId, FailureRecord>,
}

/// Single-process tracker. Leases follow the tokio clock.
#[derive(Default)]
pub struct MemoryStateTracker {
    state: Mutex<MemoryState>,
}

impl MemoryStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStateTracker for MemoryStateTracker {
    async fn mark_queued(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        self.state().queued.insert(image_id.clone());
        Ok(())
    }

    async fn unmark_queued(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        self.state().queued.remove(image_id);
        Ok(())
    }

    async fn is_queued(&self, image_id: &ImageId) -> Result<bool, TrackerError> {
        Ok(self.state().queued.contains(image_id))
    }

    async fn mark_in_progress(
        &self,
        image_id: &ImageId,
        options: &GenerationOptions,
        lease: Duration,
    ) -> Result<bool, TrackerError> {
        let now = Instant::now();
        let mut state = self.state();
        if state.in_progress.get(image_id).is_some_and(|held| held.deadline > now) {
            return Ok(false);
        }
        state.in_progress.insert(
            image_id.clone(),
            Lease {
                deadline: now + lease,
                options: options.clone(),
            },
        );
        Ok(true)
    }

    async fn unmark_in_progress(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        self.state().in_progress.remove(image_id);
        Ok(())
    }

    async fn is_in_progress(&self, image_id: &ImageId) -> Result<bool, TrackerError> {
        let now = Instant::now();
        Ok(self
            .state()
            .in_progress
            .get(image_id)
            .is_some_and(|held| held.deadline > now))
    }

    async fn running_options(&self, image_id: &ImageId) -> Result<Option<GenerationOptions>, TrackerError> {
        let now = Instant::now();
        Ok(self
            .state()
            .in_progress
            .get(image_id)
            .filter(|held| held.deadline > now)
            .map(|held| held.options.clone()))
    }

    async fn mark_failed(&self, image_id: &ImageId, message: &str) -> Result<(), TrackerError> {
        self.state().failed.insert(
            image_id.clone(),
            FailureRecord {
                message: message.to_string(),
                failed_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn clear_failed(&self, image_id: &ImageId) -> Result<(), TrackerError> {
        self.state().failed.remove(image_id);
        Ok(())
    }

    async fn failure(&self, image_id: &ImageId) -> Result<Option<FailureRecord>, TrackerError> {
        Ok(self.state().failed.get(image_id).cloned())
    }

    async fn queued_ids(&self) -> Result<Vec<ImageId>, TrackerError> {
        Ok(self.state().queued.iter().cloned().collect())
    }

    async fn in_progress_ids(&self) -> Result<Vec<ImageId>, TrackerError> {
        let now = Instant::now();
        Ok(self
            .state()
            .in_progress
            .iter()
            .filter(|(_, held)| held.deadline > now)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn failed_ids(&self) -> Result<Vec<ImageId>, TrackerError> {
        Ok(self.state().failed.keys().cloned().collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> ImageId {
        ImageId::parse(raw).unwrap()
    }

    fn opts() -> GenerationOptions {
        GenerationOptions::default()
    }

    #[tokio::test]
    async fn test_queued_set() {
        let tracker = MemoryStateTracker::new();
        assert!(!tracker.is_queued(&id("1")).await.unwrap());
        tracker.mark_queued(&id("1")).await.unwrap();
        tracker.mark_queued(&id("1")).await.unwrap();
        assert!(tracker.is_queued(&id("1")).await.unwrap());
        assert_eq!(tracker.queued_ids().await.unwrap(), vec![id("1")]);
        tracker.unmark_queued(&id("1")).await.unwrap();
        assert!(!tracker.is_queued(&id("1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_progress_is_exclusive() {
        let tracker = MemoryStateTracker::new();
        let lease = Duration::from_secs(60);
        assert!(tracker.mark_in_progress(&id("5"), &opts(), lease).await.unwrap());
        assert!(!tracker.mark_in_progress(&id("5"), &opts(), lease).await.unwrap());
        assert!(tracker.mark_in_progress(&id("6"), &opts(), lease).await.unwrap());

        tracker.unmark_in_progress(&id("5")).await.unwrap();
        assert!(!tracker.is_in_progress(&id("5")).await.unwrap());
        assert!(tracker.mark_in_progress(&id("5"), &opts(), lease).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_released() {
        let tracker = MemoryStateTracker::new();
        assert!(tracker.mark_in_progress(&id("5"), &opts(), Duration::from_secs(10)).await.unwrap());
        assert!(tracker.is_in_progress(&id("5")).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!tracker.is_in_progress(&id("5")).await.unwrap());
        assert!(tracker.in_progress_ids().await.unwrap().is_empty());
        assert!(tracker.mark_in_progress(&id("5"), &opts(), Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_options_follow_lease() {
        let tracker = MemoryStateTracker::new();
        assert!(tracker.running_options(&id("7")).await.unwrap().is_none());

        let mut options = opts();
        options.overrides.insert("steps".to_string(), "32".to_string());
        assert!(tracker.mark_in_progress(&id("7"), &options, Duration::from_secs(10)).await.unwrap());
        assert_eq!(tracker.running_options(&id("7")).await.unwrap(), Some(options.clone()));

        // A refused claim leaves the holder's options in place.
        assert!(!tracker.mark_in_progress(&id("7"), &opts(), Duration::from_secs(10)).await.unwrap());
        assert_eq!(tracker.running_options(&id("7")).await.unwrap(), Some(options));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tracker.running_options(&id("7")).await.unwrap().is_none());

        assert!(tracker.mark_in_progress(&id("7"), &opts(), Duration::from_secs(10)).await.unwrap());
        tracker.unmark_in_progress(&id("7")).await.unwrap();
        assert!(tracker.running_options(&id("7")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_marker() {
        let tracker = MemoryStateTracker::new();
        tracker.mark_failed(&id("3"), "service unavailable").await.unwrap();
        let record = tracker.failure(&id("3")).await.unwrap().unwrap();
        assert_eq!(record.message, "service unavailable");
        assert_eq!(tracker.failed_ids().await.unwrap(), vec![id("3")]);

        tracker.clear_failed(&id("3")).await.unwrap();
        assert!(tracker.failure(&id("3")).await.unwrap().is_none());
    }
}
