use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::models::job::GenerationOptions;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Location of a generated artifact on the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteArtifactRef {
    pub url: String,
}

/// The external image-to-splat conversion service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// True only when the service answers 200 with `status: ok` and a
    /// loaded model.
    async fn health_check(&self) -> bool;

    /// Upload `image_bytes` and wait up to `timeout` for the generated artifact.
    async fn generate(
        &self,
        image_bytes: &[u8],
        filename: &str,
        options: &GenerationOptions,
        timeout: Duration,
    ) -> Result<RemoteArtifactRef, GenerationError>;

    /// Stream the artifact into `destination`. On `false` the file contents
    /// are unusable even if some bytes were written.
    async fn download(&self, reference: &RemoteArtifactRef, destination: &Path) -> bool;
}

/// HTTP client for the generation service.
pub struct HttpGenerationClient {
    http: Client,
    base_url: String,
    download_timeout: Duration,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    url: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(base_url: &str, download_timeout: Duration) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .user_agent(concat!("splat-forge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(GenerationError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            download_timeout,
        })
    }

    /// The service may answer with a path relative to its own base URL.
    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    async fn fetch_to(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let mut response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(DownloadError::Status(response.status()));
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(DownloadError::Empty);
        }
        Ok(written)
    }
}

fn is_truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(serde_json::Value::String(s)) => !s.is_empty() && s != "0",
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::Object(o)) => !o.is_empty(),
        Some(serde_json::Value::Null) | None => false,
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let response = match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, url = %url, "Generation service health check failed");
                return false;
            }
        };

        if response.status() != StatusCode::OK {
            tracing::warn!(status = %response.status(), "Generation service reported unhealthy");
            return false;
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) => {
                body.get("status").and_then(|s| s.as_str()) == Some("ok")
                    && is_truthy(body.get("model_loaded"))
            }
            Err(e) => {
                tracing::error!(error = %e, "Generation service health response was not JSON");
                false
            }
        }
    }

    async fn generate(
        &self,
        image_bytes: &[u8],
        filename: &str,
        options: &GenerationOptions,
        timeout: Duration,
    ) -> Result<RemoteArtifactRef, GenerationError> {
        let mime = image::guess_format(image_bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");

        let part = Part::bytes(image_bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(GenerationError::Http)?;

        let mut form = Form::new()
            .part("image", part)
            .text("format", options.format.to_string());
        for (key, value) in &options.overrides {
            form = form.text(key.clone(), value.clone());
        }

        let response = self
            .http
            .post(format!("{}/generate", self.base_url))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(GenerationError::Http)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                code: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let body: GenerateResponse = response.json().await.map_err(GenerationError::Http)?;
        match body.url.filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                tracing::info!(filename = %filename, url = %url, "Generation service produced splat");
                Ok(RemoteArtifactRef { url })
            }
            None => Err(GenerationError::MissingReference),
        }
    }

    async fn download(&self, reference: &RemoteArtifactRef, destination: &Path) -> bool {
        let url = self.resolve(&reference.url);
        match self.fetch_to(&url, destination).await {
            Ok(bytes) => {
                tracing::info!(
                    url = %url,
                    size_mb = %format!("{:.2}", bytes as f64 / 1024.0 / 1024.0),
                    destination = %destination.display(),
                    "Downloaded splat"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, url = %url, "Failed to download splat");
                false
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Generation service returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Generation service returned no artifact URL")]
    MissingReference,

    #[error("Source image is {size} bytes, limit is {limit}")]
    ImageTooLarge { size: u64, limit: u64 },
}

impl GenerationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GenerationError::Http(e) if e.is_timeout())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {0}")]
    Status(StatusCode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Response contained no bytes")]
    Empty,
}
