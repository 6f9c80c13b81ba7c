use std::sync::OnceLock;

use regex::Regex;

use crate::config::PromptPolicy;

/// Sanitized prompts shorter than this get a neutral descriptor appended.
pub const MIN_PROMPT_CHARS: usize = 20;

const NEUTRAL_DESCRIPTOR: &str =
    "serene atmosphere, soft cinematic lighting, painterly illustration style";

/// Last rung of the escalation ladder. Generic enough to pass any filter.
pub const ULTRA_SAFE_PROMPT: &str =
    "A tranquil landscape at golden hour, soft light over gentle hills, calm water, peaceful mood";

/// High-risk vocabulary. Each entry carries its own suffix allowance so
/// short stems like `war` do not swallow `warm`.
const RISK_TERMS: &[&str] = &[
    // violence
    r"blood\w*", r"bleed\w*", r"gore", r"gory", r"kill\w*", r"murder\w*", r"slaughter\w*",
    r"wound\w*", r"injur\w*", r"violen\w*", r"attack\w*", r"fight\w*", r"war(?:s|fare)?",
    r"battle\w*", r"assault\w*", r"tortur\w*", r"stab\w*", r"shoot\w*", r"terror\w*",
    r"cruel\w*", r"abus\w*", r"hostages?",
    // weapons
    r"weapon\w*", r"guns?", r"gunfire", r"pistols?", r"rifles?", r"knife", r"knives",
    r"swords?", r"blades?", r"daggers?", r"bullets?", r"bombs?",
    r"explo(?:de|ded|des|sion|sions|sive|sives)",
    // death
    r"dead(?:ly)?", r"death\w*", r"d(?:ie|ies|ied|ying)", r"corpses?", r"skull\w*",
    // nudity and sexual content
    r"naked", r"nude\w*", r"nudity", r"sex\w*", r"erotic\w*", r"breasts?", r"lingerie",
    r"underwear", r"seduc\w*",
    // self-harm
    r"suicid\w*", r"self-harm\w*", r"hang(?:ed|ing)",
    // substances
    r"drug\w*", r"cocaine", r"heroin", r"alcohol\w*", r"drunk\w*", r"cigarettes?",
    r"smok(?:e|es|ed|ing)", r"syringes?",
    // bedroom and intimacy, frequent false positives
    r"kiss\w*", r"beds?", r"bedroom\w*", r"bedsheets?", r"intima\w*", r"embrac\w*",
];

/// Whole-word, case-insensitive removal of high-risk words.
pub fn sanitize(prompt: &str) -> String {
    static RISK_RE: OnceLock<Regex> = OnceLock::new();
    let re = RISK_RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b(?:{})\b", RISK_TERMS.join("|")))
            .expect("risk vocabulary regex should compile")
    });
    let stripped = tidy(&re.replace_all(prompt, ""));
    if stripped.chars().count() >= MIN_PROMPT_CHARS {
        return stripped;
    }
    if stripped.is_empty() {
        NEUTRAL_DESCRIPTOR.to_string()
    } else {
        format!("{stripped}, {NEUTRAL_DESCRIPTOR}")
    }
}

pub fn normalize_prompt(prompt: &str, policy: &PromptPolicy) -> String {
    static DIRECTIVE_RE: OnceLock<Regex> = OnceLock::new();
    static CLOSE_UP_RE: OnceLock<Regex> = OnceLock::new();
    static BOILERPLATE_RE: OnceLock<Regex> = OnceLock::new();
    static REPEATED_SHOT_RE: OnceLock<Regex> = OnceLock::new();

    let directives = DIRECTIVE_RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)--ar\s*\d+\s*:\s*\d+",
            r"|\b(?:aspect\s*)?ratio\s*[:=]?\s*\d+\s*[:x]\s*\d+",
            r"|\b(?:16:9|9:16|4:3|3:4|3:2|2:3|1:1|21:9)\b",
            r"|\b(?:camera|lens|angle|shot on)\s*[:：][^,;\n]*",
            r"|\b\d{2,3}\s*mm\b",
            r"|\bf/\d+(?:\.\d+)?",
            r"|\b(?:chapter|section)\s*\d+\s*[:.\-]?",
            r"|第[一二三四五六七八九十百\d]+[章节]",
        ))
        .expect("directive regex should compile")
    });
    let close_up = CLOSE_UP_RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)\b(?:extreme\s+)?close[\s-]?ups?\b",
            r"|\bmacro(?:\s+shot)?\b",
            r"|\bextreme(?:ly)?\s+detail(?:ed|s)?\b",
            r"|\bface[\s-]focus(?:ed)?\b",
        ))
        .expect("close-up regex should compile")
    });
    let boilerplate = BOILERPLATE_RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^\s*(?:(?:create|generate|draw|paint)\s+)?(?:an?\s+)?(?:cinematic\s+)?",
            r"(?:image|picture|illustration|scene)\s+(?:of|showing|depicting)\s+",
        ))
        .expect("boilerplate regex should compile")
    });
    let repeated_shot = REPEATED_SHOT_RE.get_or_init(|| {
        Regex::new(r"(?i)medium shot(?:[\s,]+medium shot)+").expect("repeat regex should compile")
    });

    let without_directives = directives.replace_all(prompt, "");
    let neutral_framing = close_up.replace_all(&without_directives, "medium shot");
    let collapsed = repeated_shot.replace_all(&neutral_framing, "medium shot");
    let tidied = tidy(&collapsed);
    let body = tidy(&boilerplate.replace(&tidied, ""));

    let constraint = policy.subject_constraint.trim();
    if constraint.is_empty() || body.to_lowercase().contains(&constraint.to_lowercase()) {
        return body;
    }
    if body.is_empty() {
        return constraint.to_string();
    }
    format!("{constraint}, {body}")
}

fn tidy(raw: &str) -> String {
    static SPACE_RE: OnceLock<Regex> = OnceLock::new();
    static BEFORE_PUNCT_RE: OnceLock<Regex> = OnceLock::new();
    static REPEATED_PUNCT_RE: OnceLock<Regex> = OnceLock::new();
    let space = SPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("space regex should compile"));
    let before_punct = BEFORE_PUNCT_RE
        .get_or_init(|| Regex::new(r"\s+([,.;:!?])").expect("punct regex should compile"));
    let repeated_punct = REPEATED_PUNCT_RE.get_or_init(|| {
        Regex::new(r"([,;:])(?:\s*[,;:])+").expect("repeated punct regex should compile")
    });

    let text = space.replace_all(raw, " ");
    let text = before_punct.replace_all(&text, "$1");
    let text = repeated_punct.replace_all(&text, "$1");
    text.trim_matches(|ch: char| ch.is_whitespace() || matches!(ch, ',' | ';' | ':'))
        .to_string()
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;
    use crate::config::PromptPolicy;

    fn contains_word(haystack: &str, stem: &str) -> bool {
        Regex::new(&format!(r"(?i)\b{stem}\w*\b"))
            .map(|re| re.is_match(haystack))
            .unwrap_or(false)
    }

    #[test]
    fn sanitize_removes_suffixed_forms_case_insensitively() {
        let out = sanitize("a bloody knife fight");
        for stem in ["blood", "knife", "fight"] {
            assert!(!contains_word(&out, stem), "{stem} survived in {out:?}");
        }
        let out = sanitize("Two Soldiers FIGHTING beside a Bloodied river at dawn, mist everywhere");
        assert!(!contains_word(&out, "fight"));
        assert!(!contains_word(&out, "blood"));
        assert!(out.contains("river at dawn"));
    }

    #[test]
    fn sanitize_leaves_lookalike_words_alone() {
        let out = sanitize("warm lantern light over a wardrobe and a diet journal, shot from afar");
        assert_eq!(
            out,
            "warm lantern light over a wardrobe and a diet journal, shot from afar"
        );
    }

    #[test]
    fn short_results_are_padded() {
        let out = sanitize("a bloody knife fight");
        assert!(out.chars().count() >= MIN_PROMPT_CHARS);
        assert!(out.starts_with("a, "));
        assert_eq!(sanitize("blood"), NEUTRAL_DESCRIPTOR);
    }

    #[test]
    fn sanitize_tidies_leftover_punctuation() {
        assert_eq!(
            sanitize("a quiet harbour, knife, lanterns glowing softly on the water"),
            "a quiet harbour, lanterns glowing softly on the water"
        );
    }

    #[test]
    fn normalize_strips_directives_and_close_ups() {
        let policy = PromptPolicy {
            subject_constraint: "East Asian characters".to_string(),
        };
        let out = normalize_prompt(
            "An image of an extreme close-up of a girl reading, Chapter 3: camera: 85mm f/1.8, --ar 16:9",
            &policy,
        );
        assert!(!out.to_lowercase().contains("close"));
        assert!(!out.contains("85mm"));
        assert!(!out.contains("16:9"));
        assert!(!out.to_lowercase().contains("chapter"));
        assert!(!out.to_lowercase().starts_with("an image of"));
        assert!(out.starts_with("East Asian characters, "));
        assert!(out.contains("medium shot of a girl reading"));
    }

    #[test]
    fn normalize_does_not_duplicate_constraint() {
        let policy = PromptPolicy {
            subject_constraint: "East Asian characters".to_string(),
        };
        let out = normalize_prompt("two east asian characters share tea", &policy);
        assert_eq!(out, "two east asian characters share tea");
        let out = normalize_prompt("a quiet street", &PromptPolicy {
            subject_constraint: String::new(),
        });
        assert_eq!(out, "a quiet street");
    }

    #[test]
    fn ultra_safe_prompt_is_already_clean() {
        assert_eq!(sanitize(ULTRA_SAFE_PROMPT), ULTRA_SAFE_PROMPT);
    }
}
