use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::db::queries;
use crate::models::artifact::{Artifact, NewArtifact};
use crate::models::image::{ImageId, SourceImage};

/// Metadata lookups: the source-image catalog and artifact records.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn source_image(&self, image_id: &ImageId) -> Result<Option<SourceImage>, CatalogError>;

    async fn find_artifact(&self, uri: &str) -> Result<Option<Artifact>, CatalogError>;

    async fn upsert_artifact(&self, artifact: NewArtifact) -> Result<Artifact, CatalogError>;

    /// Returns whether a record existed.
    async fn delete_artifact(&self, uri: &str) -> Result<bool, CatalogError>;

    async fn ping(&self) -> Result<(), CatalogError>;
}

/// PostgreSQL-backed catalog.
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn source_image(&self, image_id: &ImageId) -> Result<Option<SourceImage>, CatalogError> {
        Ok(queries::get_source_image(&self.pool, image_id).await?)
    }

    async fn find_artifact(&self, uri: &str) -> Result<Option<Artifact>, CatalogError> {
        Ok(queries::find_artifact_by_uri(&self.pool, uri).await?)
    }

    async fn upsert_artifact(&self, artifact: NewArtifact) -> Result<Artifact, CatalogError> {
        Ok(queries::upsert_artifact(&self.pool, &artifact).await?)
    }

    async fn delete_artifact(&self, uri: &str) -> Result<bool, CatalogError> {
        Ok(queries::delete_artifact_by_uri(&self.pool, uri).await?)
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        Ok(queries::ping(&self.pool).await?)
    }
}

/// In-process catalog for single-node runs and tests.
#[derive(Default)]
pub struct MemoryCatalog {
    images: Mutex<HashMap<ImageId, SourceImage>>,
    artifacts: Mutex<HashMap<String, Artifact>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_source_image(&self, image: SourceImage) {
        lock(&self.images).insert(image.id.clone(), image);
    }

    pub fn artifact_count(&self) -> usize {
        lock(&self.artifacts).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn source_image(&self, image_id: &ImageId) -> Result<Option<SourceImage>, CatalogError> {
        Ok(lock(&self.images).get(image_id).cloned())
    }

    async fn find_artifact(&self, uri: &str) -> Result<Option<Artifact>, CatalogError> {
        Ok(lock(&self.artifacts).get(uri).cloned())
    }

    async fn upsert_artifact(&self, artifact: NewArtifact) -> Result<Artifact, CatalogError> {
        let mut artifacts = lock(&self.artifacts);
        let record = match artifacts.get(&artifact.uri) {
            Some(existing) => Artifact {
                image_id: artifact.image_id,
                format: artifact.format,
                owner_id: artifact.owner_id.or_else(|| existing.owner_id.clone()),
                ..existing.clone()
            },
            None => Artifact {
                id: Uuid::new_v4(),
                image_id: artifact.image_id,
                uri: artifact.uri.clone(),
                format: artifact.format,
                owner_id: artifact.owner_id,
                created_at: Utc::now(),
            },
        };
        artifacts.insert(artifact.uri, record.clone());
        Ok(record)
    }

    async fn delete_artifact(&self, uri: &str) -> Result<bool, CatalogError> {
        Ok(lock(&self.artifacts).remove(uri).is_some())
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ArtifactFormat;

    fn new_artifact(owner: Option<&str>) -> NewArtifact {
        NewArtifact {
            image_id: ImageId::parse("9").unwrap(),
            uri: "splats/9.sog".to_string(),
            format: ArtifactFormat::Compressed,
            owner_id: owner.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity_and_owner() {
        let catalog = MemoryCatalog::new();
        let first = catalog.upsert_artifact(new_artifact(Some("alice"))).await.unwrap();
        let second = catalog.upsert_artifact(new_artifact(None)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.owner_id.as_deref(), Some("alice"));
        assert_eq!(catalog.artifact_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let catalog = MemoryCatalog::new();
        catalog.upsert_artifact(new_artifact(None)).await.unwrap();
        assert!(catalog.delete_artifact("splats/9.sog").await.unwrap());
        assert!(!catalog.delete_artifact("splats/9.sog").await.unwrap());
    }
}
