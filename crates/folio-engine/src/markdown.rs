use pulldown_cmark::{html, Options, Parser};

/// Markdown to HTML. Implementations must pass raw HTML comments through
/// verbatim; wrapping one in a block element is tolerated by the assembler.
pub trait MarkdownRenderer: Send + Sync {
    fn render(&self, markdown: &str) -> String;
}

/// CommonMark renderer with tables and strikethrough enabled.
#[derive(Debug, Clone, Copy)]
pub struct CommonMarkRenderer {
    options: Options,
}

impl Default for CommonMarkRenderer {
    fn default() -> Self {
        Self {
            options: Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH,
        }
    }
}

impl MarkdownRenderer for CommonMarkRenderer {
    fn render(&self, markdown: &str) -> String {
        let parser = Parser::new_ext(markdown, self.options);
        let mut out = String::with_capacity(markdown.len() + markdown.len() / 2);
        html::push_html(&mut out, parser);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{CommonMarkRenderer, MarkdownRenderer};

    #[test]
    fn comment_lines_survive_rendering() {
        let html = CommonMarkRenderer::default()
            .render("# Title\n\nFirst *line*\n<!--FOLIO_SCENE_2_SLOT-->\nsecond line\n");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<!--FOLIO_SCENE_2_SLOT-->"));
        assert!(html.contains("<em>line</em>"));
        assert!(html.contains("second line"));
    }

    #[test]
    fn tables_are_enabled() {
        let html = CommonMarkRenderer::default().render("| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<table>"));
    }
}
