use std::sync::Arc;

use folio_contracts::{RenderedResult, Scene};
use regex::{NoExpand, Regex};

use crate::anchor::{byte_offset_at_char, floor_char_boundary, proportional_fallback, AnchorLocator};
use crate::fragments::{clean_fragment, interactive_fragment, placeholder_token};
use crate::markdown::{CommonMarkRenderer, MarkdownRenderer};

/// How far a proportional placement may slide forward to reach a line break.
const NEWLINE_SNAP_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    SectionBoundary,
    Quote,
    Proportional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub scene_id: u32,
    /// Offset in the token-annotated markdown where the token block starts.
    pub offset: usize,
    pub strategy: PlacementStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedDocument {
    pub markdown: String,
    pub placements: Vec<Placement>,
}

/// Splices scene tokens into the source, renders it, and swaps the tokens
/// for interactive and export markup.
#[derive(Clone)]
pub struct DocumentAssembler {
    renderer: Arc<dyn MarkdownRenderer>,
}

impl Default for DocumentAssembler {
    fn default() -> Self {
        Self::new(Arc::new(CommonMarkRenderer::default()))
    }
}

impl DocumentAssembler {
    pub fn new(renderer: Arc<dyn MarkdownRenderer>) -> Self {
        Self { renderer }
    }

    pub fn assemble(&self, full_text: &str, scenes: &[Scene]) -> RenderedResult {
        let placed = self.place(full_text, scenes);
        let rendered = self.renderer.render(&placed.markdown);

        let mut html_content = rendered.clone();
        let mut clean_html_content = rendered;
        for placement in &placed.placements {
            let Some(scene) = scenes.iter().find(|scene| scene.id == placement.scene_id) else {
                continue;
            };
            let token = placeholder_token(scene.id);
            html_content = substitute_token(&html_content, &token, &interactive_fragment(scene));
            clean_html_content = substitute_token(&clean_html_content, &token, &clean_fragment(scene));
        }

        RenderedResult {
            markdown_with_images: placed.markdown,
            html_content,
            clean_html_content,
        }
    }

    /// Inserts one token per non-pending scene, in ascending id order.
    ///
    /// Offsets are always derived from `full_text` afresh, so the result
    /// depends only on the text and the scene snapshot.
    pub fn place(&self, full_text: &str, scenes: &[Scene]) -> PlacedDocument {
        let mut queue: Vec<&Scene> = scenes.iter().filter(|scene| scene.occupies_slot()).collect();
        queue.sort_by_key(|scene| scene.id);

        let locator = AnchorLocator::new(full_text);
        let mut working = full_text.to_string();
        let mut last_insert = 0usize;
        let mut insertion_offset = 0usize;
        let mut placements = Vec::with_capacity(queue.len());

        for (idx, scene) in queue.iter().enumerate() {
            let block = format!("\n{}\n", placeholder_token(scene.id));
            let (offset, strategy) = if scene.is_cover() {
                let target = locator.section_boundary() + insertion_offset;
                if target <= working.len() {
                    (floor_char_boundary(&working, target), PlacementStrategy::SectionBoundary)
                } else {
                    (proportional_fallback(&working), PlacementStrategy::Proportional)
                }
            } else if let Some(found) = locator.locate(&working, scene, last_insert) {
                (found, PlacementStrategy::Quote)
            } else {
                let remaining = queue.len() - idx;
                (
                    proportional_offset(&working, last_insert, remaining),
                    PlacementStrategy::Proportional,
                )
            };

            working.insert_str(offset, &block);
            last_insert = offset + block.len();
            insertion_offset += block.len();
            placements.push(Placement {
                scene_id: scene.id,
                offset,
                strategy,
            });
        }

        PlacedDocument {
            markdown: working,
            placements,
        }
    }
}

/// Splits the unconsumed tail into `remaining + 1` chunks and targets the
/// first boundary, nudged forward to the next line break when one is near.
fn proportional_offset(text: &str, from: usize, remaining: usize) -> usize {
    let from = floor_char_boundary(text, from);
    let tail = &text[from..];
    let chunk = tail.chars().count() / (remaining + 1);
    let target = from + byte_offset_at_char(tail, chunk);
    text[target..]
        .char_indices()
        .take(NEWLINE_SNAP_CHARS)
        .find(|(_, ch)| *ch == '\n')
        .map(|(idx, _)| target + idx)
        .unwrap_or(target)
}

/// Replaces every occurrence of `token`, including a paragraph-wrapped or
/// entity-escaped copy of it.
fn substitute_token(html: &str, token: &str, fragment: &str) -> String {
    let wrapped = Regex::new(&format!(r"<p>\s*{}\s*</p>", regex::escape(token)));
    let mut out = match wrapped {
        Ok(re) => re.replace_all(html, NoExpand(fragment)).into_owned(),
        Err(_) => html.to_string(),
    };
    out = out.replace(token, fragment);
    let escaped = token.replace('<', "&lt;").replace('>', "&gt;");
    out.replace(&escaped, fragment)
}
