use serde::{Deserialize, Serialize};

/// Output of one assembly pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedResult {
    /// Source markdown with a placeholder token spliced in per placed scene.
    pub markdown_with_images: String,
    /// HTML with status-aware markup and regenerate/retry controls.
    pub html_content: String,
    /// HTML for export: completed images only, inline styles, no controls.
    pub clean_html_content: String,
}
