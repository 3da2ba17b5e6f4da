//! Ordering and token-budgeted packing of retrieved messages

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

use super::retriever::SearchResult;
use crate::utils::estimate_tokens;

/// Scores this close to a group's leading score count as a tie.
pub const TIE_BREAK_WINDOW: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub max_messages: usize,
    pub max_tokens: usize,
    /// A single message above this estimate stops packing
    pub per_message_token_cap: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            max_tokens: 4000,
            per_message_token_cap: 500,
        }
    }
}

/// One packed context message, numbered by its position
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    pub message_id: String,
    pub content: String,
    pub username: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Display form of `created_at`
    pub timestamp: String,
    pub created_at: DateTime<Utc>,
    pub score: f32,
}

impl MessageContext {
    fn from_result(result: &SearchResult) -> Self {
        Self {
            message_id: result.message_id.clone(),
            content: result.content.clone(),
            username: result.username.clone(),
            channel_id: result.channel_id.clone(),
            channel_name: result.channel_name.clone(),
            timestamp: format_timestamp(&result.created_at),
            created_at: result.created_at,
            score: result.score,
        }
    }

    /// `username in #channel at timestamp:\ncontent`
    pub fn formatted(&self) -> String {
        format!(
            "{} in #{} at {}:\n{}",
            self.username, self.channel_name, self.timestamp, self.content
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledContext {
    pub messages: Vec<MessageContext>,
    /// Some candidates were left out
    pub truncated: bool,
    pub total_tokens: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Numbered block: `[1] ...`, `[2] ...`. The numbers are the citation indices.
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .enumerate()
            .map(|(i, m)| format!("[{}] {}", i + 1, m.formatted()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub fn format_timestamp(created_at: &DateTime<Utc>) -> String {
    created_at.format("%Y-%m-%d %H:%M UTC").to_string()
}

pub struct ContextAssembler {
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Order `results` and pack them greedily into the budget.
    pub fn assemble(&self, results: &[SearchResult]) -> AssembledContext {
        let mut context = AssembledContext::default();

        for candidate in order_candidates(results) {
            if context.messages.len() >= self.config.max_messages {
                context.truncated = true;
                break;
            }
            let message = MessageContext::from_result(candidate);
            let tokens = estimate_tokens(&message.formatted());
            if tokens > self.config.per_message_token_cap
                || context.total_tokens + tokens > self.config.max_tokens
            {
                context.truncated = true;
                break;
            }
            context.total_tokens += tokens;
            context.messages.push(message);
        }

        debug!(
            "Packed {}/{} messages into {} tokens (truncated: {})",
            context.messages.len(),
            results.len(),
            context.total_tokens,
            context.truncated
        );
        context
    }
}

/// Score descending; within a run of scores no more than
/// [`TIE_BREAK_WINDOW`] below the run's first score, newest first.
pub fn order_candidates(results: &[SearchResult]) -> Vec<&SearchResult> {
    let mut sorted: Vec<&SearchResult> = results.iter().collect();
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    let mut ordered = Vec::with_capacity(sorted.len());
    let mut start = 0;
    while start < sorted.len() {
        let anchor = sorted[start].score;
        let mut end = start + 1;
        while end < sorted.len() && anchor - sorted[end].score <= TIE_BREAK_WINDOW + f32::EPSILON {
            end += 1;
        }
        let mut group = sorted[start..end].to_vec();
        group.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        ordered.extend(group);
        start = end;
    }
    ordered
}
