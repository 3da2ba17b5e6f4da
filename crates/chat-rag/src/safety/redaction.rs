//! Output redaction of contact details and sensitive terms

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

use crate::context_engine::ProcessedResponse;

pub const REDACTED: &str = "[REDACTED]";
pub const REDACTION_NOTE: &str = "Sensitive content was redacted from the response";

lazy_static! {
    static ref PHONE: Regex = Regex::new(
        r"(?:\+?1[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s]?)\d{3}[-.\s]?\d{4}\b"
    )
    .unwrap();
    static ref EMAIL: Regex =
        Regex::new(r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b").unwrap();
    static ref SENSITIVE_KEYWORD: Regex =
        Regex::new(r"(?i)\b(?:password|secret|key|token|credential)s?\b").unwrap();
    static ref SHELL_KEYWORD: Regex =
        Regex::new(r"(?i)\b(?:rm|delete|drop|truncate|exec|eval)\b").unwrap();
}

/// Replace every match with [`REDACTED`]. Borrowed when nothing matched.
pub fn redact_text(text: &str) -> Cow<'_, str> {
    let mut out: Option<String> = None;
    for pattern in [&*PHONE, &*EMAIL, &*SENSITIVE_KEYWORD, &*SHELL_KEYWORD] {
        let current = out.as_deref().unwrap_or(text);
        let next = match pattern.replace_all(current, REDACTED) {
            Cow::Owned(replaced) => Some(replaced),
            Cow::Borrowed(_) => None,
        };
        if next.is_some() {
            out = next;
        }
    }
    out.map_or(Cow::Borrowed(text), Cow::Owned)
}

fn redacted(text: &str) -> Option<String> {
    match redact_text(text) {
        Cow::Owned(replaced) => Some(replaced),
        Cow::Borrowed(_) => None,
    }
}

/// Redact content and citation excerpts in place. A note is appended to
/// the validation errors when anything changed; `is_valid` is untouched.
pub fn redact_response(response: &mut ProcessedResponse) -> bool {
    let mut changed = false;

    if let Some(content) = redacted(&response.content) {
        response.content = content;
        changed = true;
    }
    for citation in &mut response.citations {
        if let Some(excerpt) = redacted(&citation.content) {
            citation.content = excerpt;
            changed = true;
        }
    }

    if changed {
        response.validation_errors.push(REDACTION_NOTE.to_string());
    }
    changed
}
