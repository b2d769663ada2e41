use std::sync::Arc;

use crate::config::{AppConfig, ViewerKind};
use crate::models::artifact::Artifact;

/// Turns a finished artifact into the HTML fragment a poller swaps in for
/// its placeholder.
pub trait ViewerRenderer: Send + Sync {
    fn render(&self, artifact: &Artifact, splat_url: &str) -> String;
}

/// Container element picked up by the client-side splat viewer script.
#[derive(Debug, Clone)]
pub struct EmbeddedViewer {
    pub width: String,
    pub height: String,
    pub enable_vr: bool,
    pub enable_ar: bool,
}

impl Default for EmbeddedViewer {
    fn default() -> Self {
        Self {
            width: "100%".to_string(),
            height: "600px".to_string(),
            enable_vr: true,
            enable_ar: false,
        }
    }
}

impl ViewerRenderer for EmbeddedViewer {
    fn render(&self, artifact: &Artifact, splat_url: &str) -> String {
        format!(
            concat!(
                r#"<div class="splat-viewer" id="viewer_{id}" data-image-id="{image_id}" "#,
                r#"data-splat-url="{url}" data-format="{format}" "#,
                r#"data-enable-vr="{vr}" data-enable-ar="{ar}" "#,
                r#"style="width: {width}; height: {height};"></div>"#
            ),
            id = artifact.id,
            image_id = escape_html(artifact.image_id.as_str()),
            url = escape_html(splat_url),
            format = artifact.format,
            vr = self.enable_vr,
            ar = self.enable_ar,
            width = escape_html(&self.width),
            height = escape_html(&self.height),
        )
    }
}

/// Plain download link, for pages that load no viewer script.
#[derive(Debug, Clone, Default)]
pub struct LinkRenderer;

impl ViewerRenderer for LinkRenderer {
    fn render(&self, artifact: &Artifact, splat_url: &str) -> String {
        format!(
            r#"<a class="splat-link" href="{url}" data-image-id="{image_id}">View 3D splat ({format})</a>"#,
            url = escape_html(splat_url),
            image_id = escape_html(artifact.image_id.as_str()),
            format = artifact.format,
        )
    }
}

pub fn renderer_from_config(config: &AppConfig) -> Arc<dyn ViewerRenderer> {
    match config.viewer_kind {
        ViewerKind::Embedded => Arc::new(EmbeddedViewer {
            width: config.viewer_width.clone(),
            height: config.viewer_height.clone(),
            enable_vr: config.enable_vr,
            enable_ar: config.enable_ar,
        }),
        ViewerKind::Link => Arc::new(LinkRenderer),
    }
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::image::ImageId;
    use crate::models::job::ArtifactFormat;

    fn artifact() -> Artifact {
        Artifact {
            id: uuid::Uuid::nil(),
            image_id: ImageId::parse("42").unwrap(),
            uri: "splats/42.sog".to_string(),
            format: ArtifactFormat::Compressed,
            owner_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_embedded_viewer_attributes() {
        let html = EmbeddedViewer::default().render(&artifact(), "http://cdn.test/splats/42.sog");
        assert!(html.starts_with(r#"<div class="splat-viewer""#));
        assert!(html.contains(r#"data-splat-url="http://cdn.test/splats/42.sog""#));
        assert!(html.contains(r#"data-enable-vr="true""#));
        assert!(html.contains(r#"data-enable-ar="false""#));
        assert!(html.contains("width: 100%; height: 600px;"));
    }

    #[test]
    fn test_values_are_escaped() {
        let viewer = EmbeddedViewer {
            width: r#"1px" onload="x"#.to_string(),
            ..EmbeddedViewer::default()
        };
        let html = viewer.render(&artifact(), "http://cdn.test/a?b=1&c=<2>");
        assert!(html.contains("a?b=1&amp;c=&lt;2&gt;"));
        assert!(!html.contains(r#"onload="x"#));
    }

    #[test]
    fn test_link_renderer() {
        let html = LinkRenderer.render(&artifact(), "http://cdn.test/splats/42.sog");
        assert_eq!(
            html,
            r#"<a class="splat-link" href="http://cdn.test/splats/42.sog" data-image-id="42">View 3D splat (sog)</a>"#
        );
    }
}
