use std::sync::OnceLock;

use folio_contracts::Scene;
use regex::Regex;

/// Headers closer than this to the start are taken to be the title.
const MIN_HEADER_OFFSET_CHARS: usize = 50;
const FUZZY_TOKEN_LIMIT: usize = 5;
const FUZZY_GAP_CHARS: usize = 50;
const FALLBACK_FRACTION: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorLocator {
    section_boundary: usize,
}

impl AnchorLocator {
    pub fn new(full_text: &str) -> Self {
        Self {
            section_boundary: find_section_boundary(full_text),
        }
    }

    pub fn section_boundary(&self) -> usize {
        self.section_boundary
    }

    /// The cover scene always maps to the section boundary.
    pub fn locate(&self, text: &str, scene: &Scene, search_from: usize) -> Option<usize> {
        if scene.is_cover() {
            return Some(self.section_boundary.min(text.len()));
        }
        find_quote(text, &scene.quote, search_from)
    }
}

/// Exact match first, then the fuzzy word-window match. Returns the offset
/// just past the match.
pub fn find_quote(text: &str, quote: &str, search_from: usize) -> Option<usize> {
    if search_from > text.len() {
        return None;
    }
    let start = floor_char_boundary(text, search_from);
    let haystack = &text[start..];
    let needle = quote.trim();
    if !needle.is_empty() {
        if let Some(idx) = haystack.find(needle) {
            return Some(start + idx + needle.len());
        }
    }
    let pattern = fuzzy_pattern(needle)?;
    pattern
        .find(haystack)
        .map(|found| start + found.start() + found.len())
}

/// Builds the fuzzy matcher: the first five significant words of the quote,
/// in order, each separated by at most fifty arbitrary characters.
pub fn fuzzy_pattern(quote: &str) -> Option<Regex> {
    static SPLIT_RE: OnceLock<Regex> = OnceLock::new();
    let split = SPLIT_RE
        .get_or_init(|| Regex::new(r"[^\w\p{Han}]+").expect("token split regex should compile"));
    let tokens: Vec<String> = split
        .split(quote)
        .filter(|token| token.chars().count() > 1)
        .take(FUZZY_TOKEN_LIMIT)
        .map(regex::escape)
        .collect();
    if tokens.is_empty() {
        return None;
    }
    let gap = format!(r"[\s\S]{{0,{FUZZY_GAP_CHARS}}}?");
    Regex::new(&format!("(?m){}", tokens.join(&gap))).ok()
}

// Then the first `## ` after an introduction heading, then the 15% mark.
pub fn find_section_boundary(text: &str) -> usize {
    let mut offset = 0usize;
    let mut chars_before = 0usize;
    for line in text.split('\n') {
        if chars_before > MIN_HEADER_OFFSET_CHARS && is_section_one_header(line) {
            return offset;
        }
        offset += line.len() + 1;
        chars_before += line.chars().count() + 1;
    }
    heading_after_introduction(text).unwrap_or_else(|| proportional_fallback(text))
}

pub fn proportional_fallback(text: &str) -> usize {
    let chars = text.chars().count();
    byte_offset_at_char(text, (chars as f64 * FALLBACK_FRACTION).floor() as usize)
}

fn is_section_one_header(line: &str) -> bool {
    static HEADER_RE: OnceLock<Regex> = OnceLock::new();
    let re = HEADER_RE.get_or_init(|| {
        Regex::new(
            r"^#{0,3}\s*(?:0?1(?:\s|\.|$)|section\s*0?1(?:\D|$)|chapter\s*0?1(?:\D|$)|第一章|正文)",
        )
        .expect("section header regex should compile")
    });
    re.is_match(&line.trim().to_lowercase())
}

fn heading_after_introduction(text: &str) -> Option<usize> {
    static INTRO_RE: OnceLock<Regex> = OnceLock::new();
    let intro = INTRO_RE.get_or_init(|| {
        Regex::new(r"^#{0,6}\s*(?:引言|前言|introduction)")
            .expect("introduction regex should compile")
    });
    let mut offset = 0usize;
    let mut seen_intro = false;
    for line in text.split('\n') {
        if seen_intro && line.starts_with("## ") {
            return Some(offset);
        }
        if !seen_intro && intro.is_match(&line.trim().to_lowercase()) {
            seen_intro = true;
        }
        offset += line.len() + 1;
    }
    None
}

pub(crate) fn byte_offset_at_char(text: &str, n: usize) -> usize {
    text.char_indices()
        .nth(n)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

pub(crate) fn floor_char_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    let mut idx = idx;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
