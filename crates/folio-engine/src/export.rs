use chrono::{SecondsFormat, Utc};

use crate::fragments::escape_html;

const READING_STYLES: &str = r#"
body { margin: 0; background: #faf8f4; color: #2b2b2b; }
main { max-width: 760px; margin: 0 auto; padding: 3em 1.5em 5em; font: 18px/1.75 Georgia, "Songti SC", serif; }
h1, h2, h3 { line-height: 1.3; }
img { max-width: 100%; height: auto; }
"#;

const INTERACTIVE_STYLES: &str = r#"
.folio-scene { position: relative; margin: 2em 0; text-align: center; }
.folio-scene img { max-width: 100%; height: auto; border-radius: 8px; box-shadow: 0 4px 12px rgba(0,0,0,0.15); }
.folio-scene__badge { position: absolute; top: 10px; left: 10px; padding: 2px 8px; border-radius: 10px; background: rgba(0,0,0,0.6); color: #fff; font: 12px sans-serif; }
.folio-scene__action { position: absolute; right: 10px; bottom: 10px; opacity: 0; transition: opacity 0.2s; cursor: pointer; }
.folio-scene:hover .folio-scene__action { opacity: 1; }
.folio-scene--error { padding: 1.5em; border: 1px dashed #c0392b; border-radius: 8px; color: #c0392b; }
.folio-scene--error .folio-scene__action { position: static; opacity: 1; }
.folio-scene--generating { padding: 2em; border-radius: 8px; background: #f0ece4; }
.folio-scene__spinner { width: 32px; height: 32px; margin: 0 auto 0.5em; border: 3px solid #d8d2c6; border-top-color: #8a6d3b; border-radius: 50%; animation: folio-spin 1s linear infinite; }
@keyframes folio-spin { to { transform: rotate(360deg); } }
"#;

/// Self-contained page for the clean variant: inline styles only.
pub fn standalone_document(title: &str, body_html: &str) -> String {
    page(title, READING_STYLES, body_html)
}

/// Page for the interactive variant, including the scene-control stylesheet.
pub fn interactive_document(title: &str, body_html: &str) -> String {
    page(
        title,
        &format!("{READING_STYLES}{INTERACTIVE_STYLES}"),
        body_html,
    )
}

fn page(title: &str, styles: &str, body_html: &str) -> String {
    let generated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        concat!(
            "<!DOCTYPE html>\n",
            "<html>\n<head>\n",
            "<meta charset=\"utf-8\">\n",
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n",
            "<meta name=\"generator\" content=\"folio\">\n",
            "<meta name=\"date\" content=\"{generated}\">\n",
            "<title>{title}</title>\n",
            "<style>{styles}</style>\n",
            "</head>\n<body>\n<main>\n{body}\n</main>\n</body>\n</html>\n"
        ),
        generated = generated,
        title = escape_html(title.trim()),
        styles = styles,
        body = body_html,
    )
}

#[cfg(test)]
mod tests {
    use super::{interactive_document, standalone_document};

    #[test]
    fn standalone_page_wraps_body_and_escapes_title() {
        let html = standalone_document("Tea & <Storms>", "<p>body</p>");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>Tea &amp; &lt;Storms&gt;</title>"));
        assert!(html.contains("<main>\n<p>body</p>\n</main>"));
        assert!(!html.contains("folio-scene__spinner"));
    }

    #[test]
    fn interactive_page_carries_scene_styles() {
        let html = interactive_document("Story", "<p>body</p>");
        assert!(html.contains(".folio-scene__spinner"));
        assert!(html.contains(".folio-scene:hover .folio-scene__action"));
    }
}
