use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::image::ImageId;
use crate::models::job::ArtifactFormat;

/// Directory prefix under which every artifact is stored.
pub const ARTIFACT_PREFIX: &str = "splats";

/// Deterministic storage key for the artifact of `image_id` in `format`.
pub fn artifact_key(image_id: &ImageId, format: ArtifactFormat) -> String {
    format!("{}/{}.{}", ARTIFACT_PREFIX, image_id, format.extension())
}

/// A generated splat and its metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub image_id: ImageId,
    /// Storage key, always `splats/{image_id}.{ext}`.
    pub uri: String,
    pub format: ArtifactFormat,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to register or refresh an artifact record.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub image_id: ImageId,
    pub uri: String,
    pub format: ArtifactFormat,
    pub owner_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_layout() {
        let id = ImageId::parse("42").unwrap();
        assert_eq!(artifact_key(&id, ArtifactFormat::Compressed), "splats/42.sog");
        assert_eq!(artifact_key(&id, ArtifactFormat::Uncompressed), "splats/42.ply");
    }
}
