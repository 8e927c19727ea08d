//! Token estimation for context window management.
//!
//! The engine only needs an estimate, supplied through [`TokenEstimator`] so a
//! model-specific tokenizer can be plugged in. The default
//! [`HeuristicEstimator`] uses character ratios calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative — overestimate is safer)
//! - Code and markup: ~2.8 chars/token (denser due to punctuation)

use crate::inference::types::Role;

use super::types::ConversationMessage;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for code and tool markup.
const CODE_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── TokenEstimator ─────────────────────────────────────────────────────────

/// Token-estimate collaborator. Must be a pure function of its inputs.
pub trait TokenEstimator: Send + Sync {
    /// Estimate tokens for raw text under `model`'s tokenizer.
    fn estimate(&self, model: &str, text: &str) -> u32;

    /// Estimate tokens for one message including framing overhead.
    fn estimate_message(&self, model: &str, message: &ConversationMessage) -> u32 {
        MESSAGE_OVERHEAD_TOKENS + self.estimate(model, &message.content)
    }

    /// Sum over a message list.
    fn estimate_messages(&self, model: &str, messages: &[ConversationMessage]) -> u32 {
        messages
            .iter()
            .map(|m| self.estimate_message(model, m))
            .sum()
    }
}

/// Character-ratio estimator; model-agnostic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl HeuristicEstimator {
    /// Tool feedback and markup-heavy assistant turns tokenize like code.
    fn looks_like_code(text: &str) -> bool {
        text.contains("<tool") || text.contains("```") || text.contains("Result of ")
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, _model: &str, text: &str) -> u32 {
        let ratio = if Self::looks_like_code(text) {
            CODE_CHARS_PER_TOKEN
        } else {
            CHARS_PER_TOKEN
        };
        (text.len() as f64 / ratio).ceil() as u32
    }
}

/// Build a one-line preview of a message for logs.
pub fn summarize_message(message: &ConversationMessage) -> String {
    let label = match message.role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    let first_line = message.content.lines().next().unwrap_or("[empty]");
    format!("{label}: {}", truncate_utf8(first_line, 80))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
