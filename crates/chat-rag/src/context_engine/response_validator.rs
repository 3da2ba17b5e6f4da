//! Post-generation checks: every citation the model emits is verified
//! against the exact context list it was given.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, warn};

use super::citation_parser::{contains_citation_header, parse_citations, ParsedCitation};
use super::context_assembler::MessageContext;
use crate::llm::TokenUsage;
use crate::metrics;

lazy_static! {
    static ref CITATION_MARKER: Regex = Regex::new(r"[ \t]*\[\d+\]").unwrap();
    // Quotes and angle brackets never reach the href attribute.
    static ref MARKDOWN_LINK: Regex = Regex::new(r#"\[([^\]]+)\]\(([^)\s"'<>]+)\)"#).unwrap();
    static ref BARE_URL: Regex = Regex::new(r"https?://\S+").unwrap();
    static ref INLINE_CODE: Regex = Regex::new(r"`[^`\n]+`").unwrap();
}

pub const SOURCES_HEADING: &str = "Sources:";

pub const ERR_NO_CITATIONS: &str = "No verifiable citations found in response";
pub const ERR_NO_SOURCES: &str = "Response is missing the Sources: section";
pub const ERR_INLINE_CITATION: &str = "Citations must only appear in the Sources section";
pub const ERR_MALFORMED_SOURCES: &str =
    "Sources section does not match the expected [N] @user in #channel: format";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// 1-based position in the context list
    pub index: usize,
    pub message_id: String,
    /// Verified excerpt, quotes removed
    pub content: String,
    pub username: String,
    pub timestamp: String,
    pub channel_name: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub processing_time_ms: u64,
    pub citation_count: usize,
    pub has_code: bool,
    pub has_links: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResponse {
    pub content: String,
    pub citations: Vec<Citation>,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    pub metadata: ResponseMetadata,
}

pub struct ResponseValidator;

impl ResponseValidator {
    /// Validate `raw_answer` against `context`, the list sent to the model in
    /// the order it was numbered. Malformed output yields `is_valid = false`,
    /// never an error.
    pub fn process(
        raw_answer: &str,
        context: &[MessageContext],
        usage: TokenUsage,
        start: Instant,
    ) -> ProcessedResponse {
        let (main_raw, sources) = split_sources(raw_answer);

        let parsed = sources.map(parse_citations).unwrap_or_default();
        let citations = verify_citations(&parsed, context);
        let rejected = parsed.len().saturating_sub(citations.len());
        if rejected > 0 {
            warn!("Discarded {} of {} model citations", rejected, parsed.len());
            metrics::inc_citations_rejected(rejected as u64);
        }

        let mut validation_errors = Vec::new();
        if citations.is_empty() {
            validation_errors.push(ERR_NO_CITATIONS.to_string());
        }
        if sources.is_none() {
            validation_errors.push(ERR_NO_SOURCES.to_string());
        }
        if contains_citation_header(main_raw) {
            validation_errors.push(ERR_INLINE_CITATION.to_string());
        }
        if sources.is_some() && parsed.is_empty() {
            validation_errors.push(ERR_MALFORMED_SOURCES.to_string());
        }

        let has_code = main_raw.contains("```") || INLINE_CODE.is_match(main_raw);
        let has_links = MARKDOWN_LINK.is_match(main_raw) || BARE_URL.is_match(main_raw);

        let metadata = ResponseMetadata {
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            processing_time_ms: start.elapsed().as_millis() as u64,
            citation_count: citations.len(),
            has_code,
            has_links,
        };
        debug!(
            "Validated response: {} citations, {} errors",
            citations.len(),
            validation_errors.len()
        );

        ProcessedResponse {
            content: clean_main_content(main_raw),
            citations,
            is_valid: validation_errors.is_empty(),
            validation_errors,
            metadata,
        }
    }
}

/// Split at the first line that is exactly `Sources:` once trimmed.
fn split_sources(raw: &str) -> (&str, Option<&str>) {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        if line.trim() == SOURCES_HEADING {
            return (&raw[..offset], Some(&raw[offset + line.len()..]));
        }
        offset += line.len();
    }
    (raw, None)
}

/// Trimmed, with one pair of surrounding straight quotes removed.
fn clean_excerpt(excerpt: &str) -> &str {
    let trimmed = excerpt.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim()
}

fn verify_citations(parsed: &[ParsedCitation], context: &[MessageContext]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();

    for citation in parsed {
        let Some(source) = citation
            .index
            .checked_sub(1)
            .and_then(|i| context.get(i))
        else {
            debug!("Citation [{}] is out of range", citation.index);
            continue;
        };

        let excerpt = clean_excerpt(&citation.excerpt);
        let verified = citation.username == source.username
            && citation.channel == source.channel_name
            && !excerpt.is_empty()
            && source.content.trim().contains(excerpt);
        if !verified {
            debug!("Citation [{}] does not match message {}", citation.index, source.message_id);
            continue;
        }
        if !seen.insert(source.message_id.clone()) {
            continue;
        }

        accepted.push(Citation {
            index: citation.index,
            message_id: source.message_id.clone(),
            content: excerpt.to_string(),
            username: source.username.clone(),
            timestamp: source.timestamp.clone(),
            channel_name: source.channel_name.clone(),
            channel_id: source.channel_id.clone(),
        });
    }
    accepted
}

/// Drop `[N]` markers and turn markdown links into anchors.
fn clean_main_content(main: &str) -> String {
    let without_markers = CITATION_MARKER.replace_all(main, "");
    MARKDOWN_LINK
        .replace_all(&without_markers, r#"<a href="$2">$1</a>"#)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::base_time;

    fn context_message(id: &str, username: &str, channel: &str, content: &str) -> MessageContext {
        MessageContext {
            message_id: id.to_string(),
            content: content.to_string(),
            username: username.to_string(),
            channel_id: format!("{}-id", channel),
            channel_name: channel.to_string(),
            timestamp: "2024-01-01 12:00 UTC".to_string(),
            created_at: base_time(),
            score: 0.9,
        }
    }

    fn usage(prompt_tokens: u64, completion_tokens: u64) -> TokenUsage {
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    fn deploy_context() -> Vec<MessageContext> {
        vec![context_message("m1", "alice", "general", "the deploy is at noon")]
    }

    #[test]
    fn test_verified_citation_is_accepted() {
        let response = ResponseValidator::process(
            "It's at noon.\nSources:\n[1] @alice in #general: the deploy is at noon",
            &deploy_context(),
            usage(120, 8),
            Instant::now(),
        );

        assert!(response.is_valid, "{:?}", response.validation_errors);
        assert_eq!(response.citations.len(), 1);
        assert_eq!(response.citations[0].message_id, "m1");
        assert_eq!(response.citations[0].channel_id, "general-id");
        assert_eq!(response.content, "It's at noon.");
        assert_eq!(response.citations[0].index, 1);
        assert_eq!(response.citations[0].content, "the deploy is at noon");
        assert_eq!(response.metadata.citation_count, 1);
        assert_eq!(response.metadata.total_tokens, 128);
        assert_eq!(response.metadata.prompt_tokens, 120);
        assert_eq!(response.metadata.completion_tokens, 8);
    }

    #[test]
    fn test_fabricated_citation_is_rejected() {
        let response = ResponseValidator::process(
            "Sources:\n[1] @bob in #general: something never said",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );

        assert!(response.citations.is_empty());
        assert!(!response.is_valid);
        assert!(response.validation_errors.contains(&ERR_NO_CITATIONS.to_string()));
    }

    #[test]
    fn test_out_of_range_index_is_discarded() {
        let response = ResponseValidator::process(
            "Noon.\nSources:\n[5] @alice in #general: the deploy is at noon",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );

        assert!(response.citations.is_empty());
        assert!(!response.is_valid);
    }

    #[test]
    fn test_each_check_must_hold() {
        let context = deploy_context();
        for sources in [
            "[1] @alice in #random: the deploy is at noon",
            "[1] @alice in #general: the deploy is at midnight",
            "[1] @alice in #general: \"\"",
            "[0] @alice in #general: the deploy is at noon",
        ] {
            let raw = format!("Answer.\nSources:\n{}", sources);
            let response = ResponseValidator::process(&raw, &context, TokenUsage::default(), Instant::now());
            assert!(response.citations.is_empty(), "accepted: {}", sources);
        }
    }

    #[test]
    fn test_partial_and_quoted_excerpts_are_accepted() {
        let response = ResponseValidator::process(
            "Noon.\nSources:\n[1] @alice in #general: \"deploy is at noon\"",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );
        assert_eq!(response.citations.len(), 1);
        assert_eq!(response.citations[0].content, "deploy is at noon");
    }

    #[test]
    fn test_duplicate_citations_collapse() {
        let context = vec![
            context_message("m1", "alice", "general", "the deploy is at noon"),
            context_message("m2", "bob", "dev", "rollback plan is ready"),
        ];
        let response = ResponseValidator::process(
            "Noon.\nSources:\n[1] @alice in #general: the deploy\n[1] @alice in #general: at noon\n[2] @bob in #dev: rollback plan",
            &context,
            TokenUsage::default(),
            Instant::now(),
        );

        let ids: Vec<_> = response.citations.iter().map(|c| c.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        let indices: Vec<_> = response.citations.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_missing_sources_section() {
        let response = ResponseValidator::process("I am not sure.", &deploy_context(), TokenUsage::default(), Instant::now());

        assert!(!response.is_valid);
        assert!(response.validation_errors.contains(&ERR_NO_SOURCES.to_string()));
        assert!(!response.validation_errors.contains(&ERR_MALFORMED_SOURCES.to_string()));
    }

    #[test]
    fn test_malformed_sources_section() {
        let response = ResponseValidator::process(
            "Noon.\nSources:\n- alice said the deploy is at noon",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );
        assert!(response.validation_errors.contains(&ERR_MALFORMED_SOURCES.to_string()));
    }

    #[test]
    fn test_inline_citation_is_flagged_and_markers_stripped() {
        let response = ResponseValidator::process(
            "Per [1] @alice in #general: noon, it is at noon [1].\nSources:\n[1] @alice in #general: the deploy is at noon",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );

        assert!(!response.is_valid);
        assert!(response.validation_errors.contains(&ERR_INLINE_CITATION.to_string()));
        assert!(!response.content.contains("[1]"));
        assert!(response.content.ends_with("it is at noon."));
    }

    #[test]
    fn test_links_and_code_flags() {
        let response = ResponseValidator::process(
            "See [the runbook](https://wiki/run) and run `deploy.sh`.\nSources:\n[1] @alice in #general: the deploy is at noon",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );

        assert!(response.metadata.has_links);
        assert!(response.metadata.has_code);
        assert!(response.content.contains(r#"<a href="https://wiki/run">the runbook</a>"#));
    }

    #[test]
    fn test_link_with_quote_is_not_turned_into_anchor() {
        let response = ResponseValidator::process(
            "See [docs](https://x.y/\"onmouseover=\"alert) now.\nSources:\n[1] @alice in #general: the deploy is at noon",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );

        assert!(!response.content.contains("<a "));
        assert!(!response.content.contains("onmouseover=\"alert\">"));
    }

    #[test]
    fn test_heading_must_be_its_own_line() {
        let response = ResponseValidator::process(
            "Sources: [1] @alice in #general: the deploy is at noon",
            &deploy_context(),
            TokenUsage::default(),
            Instant::now(),
        );
        assert!(response.validation_errors.contains(&ERR_NO_SOURCES.to_string()));
        assert!(response.citations.is_empty());
    }
}
