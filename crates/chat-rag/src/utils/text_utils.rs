//! Text normalization applied before anything is embedded or queried

use lazy_static::lazy_static;
use regex::Regex;

/// Token ceiling of the embedding model.
pub const MAX_EMBEDDING_TOKENS: usize = 8191;

/// Rough characters-per-token ratio used everywhere a token count is estimated.
pub const CHARS_PER_TOKEN: usize = 4;

/// Longest input (in characters) handed to the embedding model.
pub const MAX_EMBEDDING_CHARS: usize = MAX_EMBEDDING_TOKENS * CHARS_PER_TOKEN;

lazy_static! {
    static ref FENCED_CODE: Regex = Regex::new(r"```[A-Za-z0-9_+\-]*\n?((?s).*?)```").unwrap();
    static ref INLINE_CODE: Regex = Regex::new(r"`([^`]*)`").unwrap();
    static ref BOLD_ITALIC: Regex = Regex::new(r"\*\*\*(.+?)\*\*\*").unwrap();
    static ref BOLD: Regex = Regex::new(r"\*\*(.+?)\*\*").unwrap();
    static ref UNDERSCORE_BOLD: Regex = Regex::new(r"__(.+?)__").unwrap();
    static ref ITALIC: Regex = Regex::new(r"\*(.+?)\*").unwrap();
    static ref STRIKETHROUGH: Regex = Regex::new(r"~~(.+?)~~").unwrap();
    static ref LINK: Regex = Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap();
    static ref PUNCT_WHITESPACE_RUN: Regex = Regex::new(r"(?:[^\w\s]*\s+)+[^\w\s]*").unwrap();
}

/// Strips chat markdown and noise so that embeddings see plain words.
pub struct TextNormalizer;

impl TextNormalizer {
    /// Normalize raw message or query text.
    ///
    /// Markdown emphasis, code, strikethrough and link syntax are removed (a
    /// link keeps its label, the URL is dropped), runs of punctuation mixed
    /// with whitespace collapse to one space, and the result is trimmed and
    /// cut to [`MAX_EMBEDDING_CHARS`] characters.
    pub fn normalize(text: &str) -> String {
        let text = FENCED_CODE.replace_all(text, "$1");
        let text = INLINE_CODE.replace_all(&text, "$1");
        let text = LINK.replace_all(&text, "$1");
        let text = BOLD_ITALIC.replace_all(&text, "$1");
        let text = BOLD.replace_all(&text, "$1");
        let text = UNDERSCORE_BOLD.replace_all(&text, "$1");
        let text = ITALIC.replace_all(&text, "$1");
        let text = STRIKETHROUGH.replace_all(&text, "$1");
        let text = PUNCT_WHITESPACE_RUN.replace_all(&text, " ");

        Self::truncate_chars(text.trim(), MAX_EMBEDDING_CHARS)
    }

    /// Cut `text` to at most `max_chars` characters on a char boundary.
    pub fn truncate_chars(text: &str, max_chars: usize) -> String {
        match text.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => text[..byte_idx].to_string(),
            None => text.to_string(),
        }
    }
}

/// Estimated model tokens for `text`: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strips_emphasis_and_strikethrough() {
        assert_eq!(
            TextNormalizer::normalize("**deploy** is *today* not ~~tomorrow~~"),
            "deploy is today not tomorrow"
        );
    }

    #[test]
    fn test_link_keeps_label_and_drops_url() {
        let out = TextNormalizer::normalize("see [the runbook](https://wiki.example.com/runbook) first");
        assert_eq!(out, "see the runbook first");
        assert!(!out.contains("https"));
    }

    #[test]
    fn test_code_markers_removed() {
        assert_eq!(TextNormalizer::normalize("run `cargo test` now"), "run cargo test now");
        assert_eq!(
            TextNormalizer::normalize("```bash\nmake deploy\n```"),
            "make deploy"
        );
    }

    #[test]
    fn test_punctuation_whitespace_runs_collapse() {
        assert_eq!(TextNormalizer::normalize("  hello ,  -- world!!  "), "hello world");
        assert_eq!(TextNormalizer::normalize("a\n\n\tb"), "a b");
    }

    #[test]
    fn test_truncates_to_embedding_limit() {
        let long = "a".repeat(MAX_EMBEDDING_CHARS + 500);
        assert_eq!(TextNormalizer::normalize(&long).chars().count(), MAX_EMBEDDING_CHARS);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(TextNormalizer::truncate_chars("héllo", 2), "hé");
        assert_eq!(TextNormalizer::truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    proptest! {
        #[test]
        fn normalize_never_exceeds_limit(s in ".{0,2000}") {
            let out = TextNormalizer::normalize(&s);
            prop_assert!(out.chars().count() <= MAX_EMBEDDING_CHARS);
            prop_assert_eq!(out.trim(), out.as_str());
        }

        #[test]
        fn normalize_is_deterministic(s in "[a-z *_`~\\[\\]()!,.]{0,200}") {
            prop_assert_eq!(TextNormalizer::normalize(&s), TextNormalizer::normalize(&s));
        }
    }
}
