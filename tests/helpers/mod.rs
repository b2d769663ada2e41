//! In-memory service wiring and mock collaborators for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use splat_forge::app_state::{AppState, Backends};
use splat_forge::config::AppConfig;
use splat_forge::models::image::{ImageId, SourceImage};
use splat_forge::models::job::GenerationOptions;
use splat_forge::services::catalog::MemoryCatalog;
use splat_forge::services::delivery::DeliveryLoop;
use splat_forge::services::generator::{GenerationClient, GenerationError, RemoteArtifactRef};
use splat_forge::services::queue::MemoryJobQueue;
use splat_forge::services::storage::{LocalObjectStore, ObjectStore, StorageError};
use splat_forge::services::tracker::MemoryStateTracker;

use crate::fixtures::{self, SPLAT_BYTES};

/// Failure injected into the mock generation service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenFault {
    None,
    /// Service answers 500 to every generate call
    Reject,
    /// Service answers without an artifact URL
    NoReference,
    /// Generate succeeds, fetching the artifact fails
    DownloadFails,
    /// Reject only the first N generate calls
    RejectFirst(u32),
}

/// Stand-in for the external generation service.
///
/// Tracks how many generations run at once, per image and overall.
pub struct MockGenerator {
    fault: Mutex<GenFault>,
    delay: Mutex<Duration>,
    pub healthy: AtomicBool,
    pub calls: AtomicU32,
    active: Mutex<HashMap<String, u32>>,
    total_active: AtomicU32,
    pub max_active_per_image: AtomicU32,
    pub max_active_total: AtomicU32,
    /// Options of every generate call, in call order
    pub seen_options: Mutex<Vec<GenerationOptions>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            fault: Mutex::new(GenFault::None),
            delay: Mutex::new(Duration::ZERO),
            healthy: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            active: Mutex::new(HashMap::new()),
            total_active: AtomicU32::new(0),
            max_active_per_image: AtomicU32::new(0),
            max_active_total: AtomicU32::new(0),
            seen_options: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fault(&self, fault: GenFault) {
        *self.fault.lock().unwrap() = fault;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self, filename: &str) {
        let per_image = {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(filename.to_string()).or_default();
            *count += 1;
            *count
        };
        self.max_active_per_image.fetch_max(per_image, Ordering::SeqCst);
        let total = self.total_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_total.fetch_max(total, Ordering::SeqCst);
    }

    fn leave(&self, filename: &str) {
        if let Some(count) = self.active.lock().unwrap().get_mut(filename) {
            *count -= 1;
        }
        self.total_active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationClient for MockGenerator {
    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn generate(
        &self,
        image_bytes: &[u8],
        filename: &str,
        options: &GenerationOptions,
        _timeout: Duration,
    ) -> Result<RemoteArtifactRef, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_options.lock().unwrap().push(options.clone());
        assert!(image::guess_format(image_bytes).is_ok(), "upload is not an image");

        let fault = *self.fault.lock().unwrap();
        let delay = *self.delay.lock().unwrap();

        self.enter(filename);
        tokio::time::sleep(delay).await;
        self.leave(filename);

        match fault {
            GenFault::Reject => Err(GenerationError::Status {
                code: 500,
                body: "model crashed".to_string(),
            }),
            GenFault::RejectFirst(n) if call < n => Err(GenerationError::Status {
                code: 500,
                body: "model crashed".to_string(),
            }),
            GenFault::NoReference => Err(GenerationError::MissingReference),
            _ => Ok(RemoteArtifactRef {
                url: format!("/outputs/{filename}.sog"),
            }),
        }
    }

    async fn download(&self, _reference: &RemoteArtifactRef, destination: &Path) -> bool {
        if *self.fault.lock().unwrap() == GenFault::DownloadFails {
            return false;
        }
        tokio::fs::write(destination, SPLAT_BYTES).await.is_ok()
    }
}

/// Local object store whose artifact writes can be made to fail.
pub struct FaultyObjectStore {
    inner: LocalObjectStore,
    pub fail_writes: AtomicBool,
}

#[async_trait]
impl ObjectStore for FaultyObjectStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.inner.put(key, data, content_type).await
    }

    async fn put_file(&self, key: &str, source: &Path, content_type: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put_file(key, source, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    fn public_url(&self, key: &str) -> String {
        self.inner.public_url(key)
    }
}

/// Every backend in memory or on a temp dir.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: AppConfig,
    pub catalog: Arc<MemoryCatalog>,
    pub objects: Arc<FaultyObjectStore>,
    pub tracker: Arc<MemoryStateTracker>,
    pub jobs: Arc<MemoryJobQueue>,
    pub generator: Arc<MockGenerator>,
    pub backends: Backends,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_vars(&[]).await
    }

    /// Extra environment-style settings on top of the test defaults.
    pub async fn with_vars(vars: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let storage_root = dir.path().join("public");
        let scratch_dir = dir.path().join("scratch");
        tokio::fs::create_dir_all(&scratch_dir).await.expect("scratch dir");

        let mut pairs: Vec<(String, String)> = vec![
            ("DATABASE_URL".into(), "postgres://unused/splats".into()),
            ("REDIS_URL".into(), "redis://unused".into()),
            ("STORAGE_ROOT".into(), storage_root.display().to_string()),
            ("SCRATCH_DIR".into(), scratch_dir.display().to_string()),
            ("PUBLIC_BASE_URL".into(), "http://cdn.test/files".into()),
            ("POLL_INTERVAL_MS".into(), "50".into()),
        ];
        pairs.extend(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let config: AppConfig = envy::from_iter(pairs).expect("test config");
        config.check().expect("valid test config");

        let catalog = Arc::new(MemoryCatalog::new());
        let objects = Arc::new(FaultyObjectStore {
            inner: LocalObjectStore::new(storage_root, &config.public_base_url),
            fail_writes: AtomicBool::new(false),
        });
        let tracker = Arc::new(MemoryStateTracker::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let generator = Arc::new(MockGenerator::new());

        let backends = Backends {
            catalog: catalog.clone(),
            objects: objects.clone(),
            tracker: tracker.clone(),
            jobs: jobs.clone(),
            generator: generator.clone(),
        };

        Self {
            dir,
            config,
            catalog,
            objects,
            tracker,
            jobs,
            generator,
            backends,
        }
    }

    /// Register a fixture image in the catalog and store its bytes.
    pub async fn seed(&self, image_id: &str) -> ImageId {
        let fixture = fixtures::fixture(image_id);
        let id = ImageId::parse(fixture.image_id).expect("fixture id");
        let storage_key = format!("images/{}", fixture.filename);
        self.objects
            .put(&storage_key, &fixtures::png_bytes(), "image/png")
            .await
            .expect("store source image");
        self.catalog.insert_source_image(SourceImage {
            id: id.clone(),
            storage_key,
            filename: fixture.filename.to_string(),
            owner_id: fixture.owner_id.map(str::to_string),
        });
        id
    }

    /// Register a catalog entry whose bytes were never stored.
    pub fn seed_without_bytes(&self, image_id: &str) -> ImageId {
        let id = ImageId::parse(image_id).expect("image id");
        self.catalog.insert_source_image(SourceImage {
            id: id.clone(),
            storage_key: format!("images/{image_id}.png"),
            filename: format!("{image_id}.png"),
            owner_id: None,
        });
        id
    }

    pub fn state(&self) -> AppState {
        AppState::new(&self.backends, &self.config)
    }

    pub fn delivery(&self, concurrency: usize) -> Arc<DeliveryLoop> {
        Arc::new(DeliveryLoop::new(
            self.backends.generation_queue(),
            Arc::new(self.backends.worker(&self.config)),
            self.config.max_attempts,
            self.config.poll_interval(),
            concurrency,
        ))
    }

    pub async fn scratch_is_empty(&self) -> bool {
        let mut entries = tokio::fs::read_dir(self.config.scratch_dir())
            .await
            .expect("read scratch dir");
        entries.next_entry().await.expect("scratch entry").is_none()
    }
}

/// Base URL of a running API server for the ignored end-to-end tests.
pub fn api_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// POST a generate trigger to a running server.
pub async fn trigger_generation(
    client: &reqwest::Client,
    base_url: &str,
    image_id: &str,
) -> Result<serde_json::Value, reqwest::Error> {
    client
        .post(format!("{base_url}/api/v1/splats/{image_id}/generate"))
        .json(&serde_json::json!({}))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}
