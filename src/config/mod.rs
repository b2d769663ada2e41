use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::job::ArtifactFormat;

/// Extra lease time on top of the generate and download timeouts before an
/// in-progress marker is considered abandoned.
const LEASE_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    R2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerKind {
    Embedded,
    Link,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(skip)]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string for the job queue and tracker sets
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Namespace for every Redis key this service owns
    #[serde(default = "default_key_prefix")]
    #[garde(length(min = 1, max = 64))]
    pub key_prefix: String,

    /// Base URL of the image-to-splat generation service
    #[serde(default = "default_generator_url")]
    #[garde(url)]
    pub generator_url: String,

    #[serde(default = "default_generation_timeout_secs")]
    #[garde(range(min = 10, max = 300))]
    pub generation_timeout_secs: u64,

    #[serde(default = "default_download_timeout_secs")]
    #[garde(range(min = 1, max = 600))]
    pub download_timeout_secs: u64,

    #[serde(default)]
    #[garde(skip)]
    pub default_format: ArtifactFormat,

    /// Maximum source image size in bytes (0 = no limit)
    #[serde(default)]
    #[garde(skip)]
    pub max_image_bytes: u64,

    /// Delivery attempts before a job is discarded as failed
    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 20))]
    pub max_attempts: u32,

    /// Distinct jobs a single worker process runs at once
    #[serde(default = "default_worker_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 50))]
    pub poll_interval_ms: u64,

    #[serde(default = "default_storage_backend")]
    #[garde(skip)]
    pub storage_backend: StorageBackend,

    /// Root directory for the local storage backend
    #[serde(default = "default_storage_root")]
    #[garde(skip)]
    pub storage_root: PathBuf,

    /// Prefix prepended to artifact keys to build public URLs
    #[serde(default = "default_public_base_url")]
    #[garde(length(min = 1))]
    pub public_base_url: String,

    /// R2 bucket name
    #[serde(default)]
    #[garde(skip)]
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    #[serde(default)]
    #[garde(skip)]
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    #[serde(default)]
    #[garde(skip)]
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    #[serde(default)]
    #[garde(skip)]
    pub r2_secret_key: Option<String>,

    /// Prometheus listener for the worker process; disabled when unset
    #[serde(default)]
    #[garde(skip)]
    pub worker_metrics_addr: Option<std::net::SocketAddr>,

    /// Scratch directory for downloads; system temp dir when unset
    #[serde(default)]
    #[garde(skip)]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default = "default_viewer_kind")]
    #[garde(skip)]
    pub viewer_kind: ViewerKind,

    #[serde(default = "default_viewer_width")]
    #[garde(length(min = 1, max = 32))]
    pub viewer_width: String,

    #[serde(default = "default_viewer_height")]
    #[garde(length(min = 1, max = 32))]
    pub viewer_height: String,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enable_vr: bool,

    #[serde(default)]
    #[garde(skip)]
    pub enable_ar: bool,

    /// Message shown to pollers when a generation has been given up on
    #[serde(default = "default_failure_message")]
    #[garde(length(min = 1))]
    pub failure_message: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_key_prefix() -> String {
    "splatgen".to_string()
}

fn default_generator_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./public")
}

fn default_public_base_url() -> String {
    "http://localhost:3000/files".to_string()
}

fn default_viewer_kind() -> ViewerKind {
    ViewerKind::Embedded
}

fn default_viewer_width() -> String {
    "100%".to_string()
}

fn default_viewer_height() -> String {
    "600px".to_string()
}

fn default_true() -> bool {
    true
}

fn default_failure_message() -> String {
    "Generation failed. Please try again.".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field requirements.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        if self.storage_backend == StorageBackend::R2 {
            let missing: Vec<&str> = [
                ("R2_BUCKET", &self.r2_bucket),
                ("R2_ENDPOINT", &self.r2_endpoint),
                ("R2_ACCESS_KEY", &self.r2_access_key),
                ("R2_SECRET_KEY", &self.r2_secret_key),
            ]
            .iter()
            .filter(|(_, value)| value.as_deref().map_or(true, str::is_empty))
            .map(|(name, _)| *name)
            .collect();

            if !missing.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "storage backend r2 requires {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How long an in-progress marker stays valid without being released.
    pub fn in_progress_lease(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs + self.download_timeout_secs + LEASE_MARGIN_SECS)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, envy::Error> {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "postgres://localhost/splats"),
            ("REDIS_URL", "redis://localhost"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&base()).unwrap();
        config.check().unwrap();
        assert_eq!(config.generation_timeout(), Duration::from_secs(60));
        assert_eq!(config.download_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_format, ArtifactFormat::Compressed);
        assert_eq!(config.storage_backend, StorageBackend::Local);
        assert_eq!(config.viewer_kind, ViewerKind::Embedded);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.in_progress_lease(), Duration::from_secs(150));
    }

    #[test]
    fn test_generation_timeout_range() {
        let mut pairs = base();
        pairs.push(("GENERATION_TIMEOUT_SECS", "5"));
        let config = from_pairs(&pairs).unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        let mut pairs = base();
        pairs.push(("GENERATION_TIMEOUT_SECS", "300"));
        assert!(from_pairs(&pairs).unwrap().check().is_ok());
    }

    #[test]
    fn test_poll_interval_lower_bound() {
        let mut pairs = base();
        pairs.push(("POLL_INTERVAL_MS", "10"));
        let err = from_pairs(&pairs).unwrap().check().unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));

        let mut pairs = base();
        pairs.push(("POLL_INTERVAL_MS", "50"));
        assert!(from_pairs(&pairs).unwrap().check().is_ok());
    }

    #[test]
    fn test_r2_requires_credentials() {
        let mut pairs = base();
        pairs.push(("STORAGE_BACKEND", "r2"));
        pairs.push(("R2_BUCKET", "splats"));
        let err = from_pairs(&pairs).unwrap().check().unwrap_err();
        assert!(err.to_string().contains("R2_ENDPOINT"));
    }

    #[test]
    fn test_format_accepts_descriptive_name() {
        let mut pairs = base();
        pairs.push(("DEFAULT_FORMAT", "uncompressed"));
        let config = from_pairs(&pairs).unwrap();
        assert_eq!(config.default_format, ArtifactFormat::Uncompressed);
    }
}
