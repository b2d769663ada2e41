use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_IMAGE_ID_LEN: usize = 128;

/// Opaque identity of a source image.
///
/// Restricted to `[A-Za-z0-9_-]` so it can be embedded in storage keys
/// without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId(String);

impl ImageId {
    pub fn parse(raw: &str) -> Result<Self, InvalidImageId> {
        if raw.is_empty() || raw.len() > MAX_IMAGE_ID_LEN {
            return Err(InvalidImageId(raw.to_string()));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(InvalidImageId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ImageId {
    type Err = InvalidImageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageId {
    type Error = InvalidImageId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid image id {0:?}: expected 1-128 characters of [A-Za-z0-9_-]")]
pub struct InvalidImageId(pub String);

/// A source image as seen through the content catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceImage {
    pub id: ImageId,
    /// Object-store key holding the original image bytes.
    pub storage_key: String,
    pub filename: String,
    pub owner_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_numeric_and_slug_ids() {
        assert_eq!(ImageId::parse("42").unwrap().as_str(), "42");
        assert!(ImageId::parse("hero-image_01").is_ok());
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert!(ImageId::parse("../etc/passwd").is_err());
        assert!(ImageId::parse("a/b").is_err());
        assert!(ImageId::parse("").is_err());
        assert!(ImageId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let id: ImageId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(id.to_string(), "7");
        assert!(serde_json::from_str::<ImageId>("\"no spaces\"").is_err());
    }
}
