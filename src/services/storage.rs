use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Byte storage for source images and generated artifacts, addressed by
/// slash-separated keys such as `splats/42.sog`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any existing object.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Copy a local file to `key`. Readers never observe a partial object.
    async fn put_file(&self, key: &str, source: &Path, content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove `key`. Absent objects are not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn public_url(&self, key: &str) -> String;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2ObjectStore {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl R2ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
        match status {
            200..=299 => Ok(()),
            404 => Err(StorageError::NotFound(key.to_string())),
            code => Err(StorageError::Status { key: key.to_string(), code }),
        }
    }
}

#[async_trait]
impl ObjectStore for R2ObjectStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        Self::check_status(key, response.status_code())
    }

    async fn put_file(&self, key: &str, source: &Path, content_type: &str) -> Result<(), StorageError> {
        // S3 PUT replaces the object atomically.
        let data = tokio::fs::read(source).await?;
        self.put(key, &data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        Self::check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(key).await {
            Ok((_, 404)) => Ok(false),
            Ok((_, status)) => Self::check_status(key, status).map(|_| true),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.bucket.delete_object(key).await {
            Ok(response) => match Self::check_status(key, response.status_code()) {
                Err(StorageError::NotFound(_)) => Ok(()),
                other => other,
            },
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

/// Filesystem-backed store rooted at a directory.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve `key` under the root, refusing anything that could escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Write through a sibling temp file so the final rename replaces the
    /// destination in one step.
    async fn write_atomically(&self, key: &str, source: WriteSource<'_>) -> Result<(), StorageError> {
        let destination = self.path_for(key)?;
        let parent = destination
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = destination
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let staging = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        let written = match source {
            WriteSource::Bytes(data) => tokio::fs::write(&staging, data).await,
            WriteSource::File(path) => tokio::fs::copy(path, &staging).await.map(|_| ()),
        };
        let result = match written {
            Ok(()) => tokio::fs::rename(&staging, &destination).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }
}

enum WriteSource<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.write_atomically(key, WriteSource::Bytes(data)).await
    }

    async fn put_file(&self, key: &str, source: &Path, _content_type: &str) -> Result<(), StorageError> {
        self.write_atomically(key, WriteSource::File(source)).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
