use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString};

/// Output format of a generated splat.
///
/// `compressed` is the SuperSplat `.sog` container, `uncompressed` the raw
/// `.ply` point cloud. Both the descriptive name and the extension parse.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ArtifactFormat {
    #[default]
    #[serde(rename = "sog", alias = "compressed")]
    #[strum(to_string = "sog", serialize = "compressed")]
    Compressed,

    #[serde(rename = "ply", alias = "uncompressed")]
    #[strum(to_string = "ply", serialize = "uncompressed")]
    Uncompressed,
}

impl ArtifactFormat {
    /// File extension used in the artifact storage key.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Compressed => "sog",
            ArtifactFormat::Uncompressed => "ply",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactFormat::Compressed => "application/octet-stream",
            ArtifactFormat::Uncompressed => "application/x-ply",
        }
    }
}

/// Options attached to a job at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default)]
    pub format: ArtifactFormat,

    /// Free-form parameters forwarded to the generation service.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
}

impl GenerationOptions {
    pub fn with_format(format: ArtifactFormat) -> Self {
        Self {
            format,
            overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_format_parses_both_names() {
        assert_eq!(ArtifactFormat::from_str("sog").unwrap(), ArtifactFormat::Compressed);
        assert_eq!(ArtifactFormat::from_str("compressed").unwrap(), ArtifactFormat::Compressed);
        assert_eq!(ArtifactFormat::from_str("PLY").unwrap(), ArtifactFormat::Uncompressed);
        assert_eq!(ArtifactFormat::from_str("uncompressed").unwrap(), ArtifactFormat::Uncompressed);
        assert!(ArtifactFormat::from_str("gltf").is_err());
    }

    #[test]
    fn test_format_display_is_extension() {
        assert_eq!(ArtifactFormat::Compressed.to_string(), "sog");
        assert_eq!(ArtifactFormat::Uncompressed.to_string(), ArtifactFormat::Uncompressed.extension());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: GenerationOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.format, ArtifactFormat::Compressed);
        assert!(opts.overrides.is_empty());

        let opts: GenerationOptions =
            serde_json::from_str(r#"{"format":"uncompressed","overrides":{"steps":"32"}}"#).unwrap();
        assert_eq!(opts.format, ArtifactFormat::Uncompressed);
        assert_eq!(opts.overrides.get("steps").map(String::as_str), Some("32"));
    }
}
