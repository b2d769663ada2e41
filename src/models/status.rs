use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::image::ImageId;
use crate::models::job::{ArtifactFormat, GenerationOptions};

/// Option keys that collide with the upload's own multipart fields.
const RESERVED_OVERRIDE_KEYS: [&str; 2] = ["image", "format"];

/// Body of an enqueue or regenerate request. Every field is optional.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct GenerateRequest {
    #[garde(skip)]
    pub format: Option<ArtifactFormat>,

    #[garde(length(max = 32), custom(validate_overrides))]
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

fn validate_overrides(value: &BTreeMap<String, String>, _ctx: &()) -> garde::Result {
    for (key, val) in value {
        if key.is_empty() || key.len() > 64 {
            return Err(garde::Error::new(format!("override key {key:?} must be 1-64 characters")));
        }
        if RESERVED_OVERRIDE_KEYS.contains(&key.as_str()) {
            return Err(garde::Error::new(format!("override key {key:?} is reserved")));
        }
        if val.len() > 1024 {
            return Err(garde::Error::new(format!("override value for {key:?} is too long")));
        }
    }
    Ok(())
}

impl GenerateRequest {
    /// Resolve into job options, falling back to the configured format.
    pub fn into_options(self, default_format: ArtifactFormat) -> GenerationOptions {
        GenerationOptions {
            format: self.format.unwrap_or(default_format),
            overrides: self.overrides,
        }
    }
}

/// Client-visible generation status for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    Complete {
        artifact_uri: String,
        splat_url: String,
        viewer_html: String,
    },
    Processing,
    Pending,
    Failed {
        message: String,
    },
}

impl StatusResponse {
    /// `complete` and `failed` end a polling session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusResponse::Complete { .. } | StatusResponse::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusResponse::Complete { .. } => "complete",
            StatusResponse::Processing => "processing",
            StatusResponse::Pending => "pending",
            StatusResponse::Failed { .. } => "failed",
        }
    }
}

/// Acknowledgement for enqueue and regenerate triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub status: String,
    pub image_id: ImageId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<uuid::Uuid>,
}

/// Operator view of the queue and tracker sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: u64,
    pub queued_ids: Vec<ImageId>,
    pub in_progress_ids: Vec<ImageId>,
    pub failed_ids: Vec<ImageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorHealthResponse {
    pub healthy: bool,
    pub generator_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_with_tag() {
        let json = serde_json::to_value(StatusResponse::Processing).unwrap();
        assert_eq!(json, serde_json::json!({"status": "processing"}));

        let json = serde_json::to_value(StatusResponse::Failed {
            message: "Generation failed. Please try again.".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["message"], "Generation failed. Please try again.");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!StatusResponse::Pending.is_terminal());
        assert!(!StatusResponse::Processing.is_terminal());
        assert!(StatusResponse::Failed { message: String::new() }.is_terminal());
    }

    #[test]
    fn test_reserved_override_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("format".to_string(), "ply".to_string());
        let req = GenerateRequest { format: None, overrides };
        assert!(req.validate().is_err());

        let mut overrides = BTreeMap::new();
        overrides.insert("steps".to_string(), "16".to_string());
        let req = GenerateRequest { format: None, overrides };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_into_options_uses_default_format() {
        let opts = GenerateRequest::default().into_options(ArtifactFormat::Uncompressed);
        assert_eq!(opts.format, ArtifactFormat::Uncompressed);
    }
}
