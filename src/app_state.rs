use std::sync::Arc;

use crate::config::{AppConfig, StorageBackend};
use crate::db;
use crate::models::job::ArtifactFormat;
use crate::services::{
    artifacts::ArtifactStore,
    catalog::{Catalog, PgCatalog},
    generator::{GenerationClient, GenerationError, HttpGenerationClient},
    queue::{GenerationQueue, JobQueue, QueueError, RedisJobQueue},
    render,
    status::StatusQuery,
    storage::{LocalObjectStore, ObjectStore, R2ObjectStore, StorageError},
    tracker::{JobStateTracker, RedisStateTracker, TrackerError},
    worker::{GenerationWorker, WorkerSettings},
};

/// Connected infrastructure shared by the API server and the worker.
#[derive(Clone)]
pub struct Backends {
    pub catalog: Arc<dyn Catalog>,
    pub objects: Arc<dyn ObjectStore>,
    pub tracker: Arc<dyn JobStateTracker>,
    pub jobs: Arc<dyn JobQueue>,
    pub generator: Arc<dyn GenerationClient>,
}

impl Backends {
    /// Connect every backend named by `config`. Only the API server passes
    /// `migrate`; the worker expects the schema to exist.
    pub async fn connect(
        config: &AppConfig,
        max_db_connections: u32,
        migrate: bool,
    ) -> Result<Self, StartupError> {
        tracing::info!("Connecting to PostgreSQL");
        let pool = db::init_pool(&config.database_url, max_db_connections).await?;
        if migrate {
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
        }

        tracing::info!(backend = ?config.storage_backend, "Initializing object storage");
        let objects: Arc<dyn ObjectStore> = match config.storage_backend {
            StorageBackend::Local => Arc::new(LocalObjectStore::new(
                config.storage_root.clone(),
                &config.public_base_url,
            )),
            StorageBackend::R2 => Arc::new(R2ObjectStore::new(
                config.r2_bucket.as_deref().unwrap_or_default(),
                config.r2_endpoint.as_deref().unwrap_or_default(),
                config.r2_access_key.as_deref().unwrap_or_default(),
                config.r2_secret_key.as_deref().unwrap_or_default(),
                &config.public_base_url,
            )?),
        };

        tracing::info!(prefix = %config.key_prefix, "Connecting to Redis");
        let tracker = RedisStateTracker::new(&config.redis_url, &config.key_prefix)?;
        let jobs = RedisJobQueue::new(&config.redis_url, &config.key_prefix)?;

        let generator = HttpGenerationClient::new(&config.generator_url, config.download_timeout())?;

        Ok(Self {
            catalog: Arc::new(PgCatalog::new(pool)),
            objects,
            tracker: Arc::new(tracker),
            jobs: Arc::new(jobs),
            generator: Arc::new(generator),
        })
    }

    pub fn artifact_store(&self, format: ArtifactFormat) -> Arc<ArtifactStore> {
        Arc::new(ArtifactStore::new(self.objects.clone(), self.catalog.clone(), format))
    }

    pub fn generation_queue(&self) -> Arc<GenerationQueue> {
        Arc::new(GenerationQueue::new(self.jobs.clone(), self.tracker.clone()))
    }

    pub fn worker(&self, config: &AppConfig) -> GenerationWorker {
        GenerationWorker::new(
            self.tracker.clone(),
            self.catalog.clone(),
            self.objects.clone(),
            self.generator.clone(),
            self.artifact_store(config.default_format),
            WorkerSettings {
                generation_timeout: config.generation_timeout(),
                in_progress_lease: config.in_progress_lease(),
                max_image_bytes: config.max_image_bytes,
                scratch_dir: config.scratch_dir(),
            },
        )
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn Catalog>,
    pub queue: Arc<GenerationQueue>,
    pub artifacts: Arc<ArtifactStore>,
    pub status: Arc<StatusQuery>,
    pub generator: Arc<dyn GenerationClient>,
    pub generator_url: String,
    pub default_format: ArtifactFormat,
}

impl AppState {
    pub fn new(backends: &Backends, config: &AppConfig) -> Self {
        let artifacts = backends.artifact_store(config.default_format);
        let status = StatusQuery::new(
            artifacts.clone(),
            backends.tracker.clone(),
            render::renderer_from_config(config),
            config.failure_message.clone(),
        );

        Self {
            catalog: backends.catalog.clone(),
            queue: backends.generation_queue(),
            artifacts,
            status: Arc::new(status),
            generator: backends.generator.clone(),
            generator_url: config.generator_url.clone(),
            default_format: config.default_format,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Generation client error: {0}")]
    Generator(#[from] GenerationError),
}
