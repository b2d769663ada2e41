use std::path::Path;
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::models::artifact::{artifact_key, Artifact, NewArtifact};
use crate::models::image::{ImageId, SourceImage};
use crate::models::job::ArtifactFormat;
use crate::services::catalog::{Catalog, CatalogError};
use crate::services::storage::{ObjectStore, StorageError};

/// Maps source images to their generated splats under `splats/{id}.{ext}`.
///
/// Bytes live in the object store, metadata records in the catalog. The
/// object store is authoritative: a record without bytes is ignored, bytes
/// without a record get a record on first lookup.
pub struct ArtifactStore {
    objects: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    format: ArtifactFormat,
}

impl ArtifactStore {
    /// `format` is the format status queries look for.
    pub fn new(objects: Arc<dyn ObjectStore>, catalog: Arc<dyn Catalog>, format: ArtifactFormat) -> Self {
        Self {
            objects,
            catalog,
            format,
        }
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    pub async fn lookup(&self, image_id: &ImageId) -> Result<Option<Artifact>, ArtifactError> {
        self.lookup_format(image_id, self.format).await
    }

    pub async fn lookup_format(
        &self,
        image_id: &ImageId,
        format: ArtifactFormat,
    ) -> Result<Option<Artifact>, ArtifactError> {
        let key = artifact_key(image_id, format);
        if !self.objects.exists(&key).await? {
            return Ok(None);
        }

        if let Some(artifact) = self.catalog.find_artifact(&key).await? {
            return Ok(Some(artifact));
        }

        let owner_id = self
            .catalog
            .source_image(image_id)
            .await?
            .and_then(|image| image.owner_id);

        let artifact = self
            .catalog
            .upsert_artifact(NewArtifact {
                image_id: image_id.clone(),
                uri: key,
                format,
                owner_id,
            })
            .await?;

        tracing::info!(image_id = %image_id, uri = %artifact.uri, "Registered record for existing splat");
        Ok(Some(artifact))
    }

    /// Copy `source` into place for `image`, replacing any previous artifact.
    pub async fn save(
        &self,
        image: &SourceImage,
        source: &Path,
        format: ArtifactFormat,
    ) -> Result<Artifact, ArtifactError> {
        let key = artifact_key(&image.id, format);
        self.objects.put_file(&key, source, format.content_type()).await?;

        let artifact = self
            .catalog
            .upsert_artifact(NewArtifact {
                image_id: image.id.clone(),
                uri: key,
                format,
                owner_id: image.owner_id.clone(),
            })
            .await?;

        tracing::info!(image_id = %image.id, uri = %artifact.uri, "Saved splat");
        Ok(artifact)
    }

    /// Remove the artifact and its record in every format.
    pub async fn delete(&self, image_id: &ImageId) -> Result<(), ArtifactError> {
        for format in ArtifactFormat::iter() {
            let key = artifact_key(image_id, format);
            let had_bytes = self.objects.exists(&key).await?;
            if had_bytes {
                self.objects.delete(&key).await?;
            }
            let had_record = self.catalog.delete_artifact(&key).await?;
            if had_bytes || had_record {
                tracing::info!(image_id = %image_id, uri = %key, "Deleted splat");
            }
        }
        Ok(())
    }

    pub fn public_url(&self, artifact: &Artifact) -> String {
        self.objects.public_url(&artifact.uri)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
