//! ContextManager — context window management for the conversation.
//!
//! Responsibilities:
//! - Cap the number of non-system messages kept in history
//! - Keep estimated token usage under a fraction of the model's window
//! - Report what each prune removed, for observability
//! - Track session-usage warning thresholds so each fires once
//!
//! System messages are never pruned, and neither are the most recent
//! `keep_recent` messages.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::tokens::{self, TokenEstimator};
use super::types::{ContextBudget, ConversationMessage};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default total context window size (tokens).
pub const DEFAULT_CONTEXT_WINDOW: u32 = 32_768;

/// Non-system messages retained by the count cap.
pub const DEFAULT_MAX_MESSAGES: usize = 40;

/// Most recent messages the token policy never drops.
pub const DEFAULT_KEEP_RECENT: usize = 2;

/// Fraction of the context window above which the token policy prunes.
pub const DEFAULT_TARGET_FRACTION: f64 = 0.7;

/// Usage percentages that trigger a session-limit warning.
pub const WARNING_THRESHOLDS: [u8; 4] = [85, 90, 95, 99];

// ─── Prune Report ───────────────────────────────────────────────────────────

/// Which policies removed messages in one prune call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrunePolicy {
    /// Nothing removed.
    None,
    MessageCount,
    TokenBudget,
    Both,
}

impl PrunePolicy {
    fn from_flags(by_count: bool, by_tokens: bool) -> Self {
        match (by_count, by_tokens) {
            (false, false) => PrunePolicy::None,
            (true, false) => PrunePolicy::MessageCount,
            (false, true) => PrunePolicy::TokenBudget,
            (true, true) => PrunePolicy::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub removed: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub policy: PrunePolicy,
}

impl PruneReport {
    pub fn pruned(&self) -> bool {
        self.removed > 0
    }
}

// ─── ContextManager ─────────────────────────────────────────────────────────

pub struct ContextManager {
    estimator: Arc<dyn TokenEstimator>,
    /// Model name handed to the estimator.
    model: String,
    context_window: u32,
    max_messages: usize,
    keep_recent: usize,
    target_fraction: f64,
}

impl ContextManager {
    pub fn new(estimator: Arc<dyn TokenEstimator>, model: impl Into<String>) -> Self {
        Self {
            estimator,
            model: model.into(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_messages: DEFAULT_MAX_MESSAGES,
            keep_recent: DEFAULT_KEEP_RECENT,
            target_fraction: DEFAULT_TARGET_FRACTION,
        }
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_max_messages(mut self, count: usize) -> Self {
        self.max_messages = count;
        self
    }

    pub fn with_keep_recent(mut self, count: usize) -> Self {
        self.keep_recent = count;
        self
    }

    pub fn with_target_fraction(mut self, fraction: f64) -> Self {
        self.target_fraction = fraction.clamp(0.05, 1.0);
        self
    }

    /// Switch the model (e.g. after a fallback substituted another one).
    pub fn set_model(&mut self, model: impl Into<String>, context_window: u32) {
        self.model = model.into();
        self.context_window = context_window;
    }

    /// Token usage above which the token policy prunes.
    pub fn prune_threshold(&self) -> u32 {
        (self.context_window as f64 * self.target_fraction) as u32
    }

    pub fn estimate(&self, messages: &[ConversationMessage]) -> u32 {
        self.estimator.estimate_messages(&self.model, messages)
    }

    pub fn estimate_text(&self, text: &str) -> u32 {
        self.estimator.estimate(&self.model, text)
    }

    /// Apply both policies in place. Idempotent: a list already within
    /// budget comes back untouched.
    pub fn prune(&self, messages: &mut Vec<ConversationMessage>) -> PruneReport {
        let tokens_before = self.estimate(messages);

        let by_count = self.prune_by_count(messages);
        let by_tokens = self.prune_by_tokens(messages);
        let removed = by_count + by_tokens;

        let tokens_after = if removed > 0 {
            self.estimate(messages)
        } else {
            tokens_before
        };

        let report = PruneReport {
            removed,
            tokens_before,
            tokens_after,
            policy: PrunePolicy::from_flags(by_count > 0, by_tokens > 0),
        };

        if report.pruned() {
            tracing::info!(
                removed,
                tokens_before,
                tokens_after,
                policy = ?report.policy,
                remaining_messages = messages.len(),
                "context pruned"
            );
        }
        report
    }

    /// Keep at most `max_messages` non-system messages, dropping the oldest.
    fn prune_by_count(&self, messages: &mut Vec<ConversationMessage>) -> usize {
        let cap = self.max_messages.max(self.keep_recent);
        let non_system = messages.iter().filter(|m| !m.is_system()).count();
        let mut excess = non_system.saturating_sub(cap);
        if excess == 0 {
            return 0;
        }

        let removed = excess;
        messages.retain(|m| {
            if excess > 0 && !m.is_system() {
                tracing::debug!(message = %tokens::summarize_message(m), "pruned by count");
                excess -= 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop the oldest removable message until usage fits the threshold.
    fn prune_by_tokens(&self, messages: &mut Vec<ConversationMessage>) -> usize {
        let threshold = self.prune_threshold();
        let mut total = self.estimate(messages);
        let mut removed = 0;

        while total > threshold {
            let protected_from = messages.len().saturating_sub(self.keep_recent);
            let Some(index) = messages[..protected_from]
                .iter()
                .position(|m| !m.is_system())
            else {
                tracing::warn!(
                    total,
                    threshold,
                    "context over budget with nothing left to prune"
                );
                break;
            };

            let message = messages.remove(index);
            total = total.saturating_sub(self.estimator.estimate_message(&self.model, &message));
            tracing::debug!(message = %tokens::summarize_message(&message), "pruned by tokens");
            removed += 1;
        }
        removed
    }

    /// Current context window usage.
    pub fn budget(&self, messages: &[ConversationMessage]) -> ContextBudget {
        let (system, rest): (Vec<_>, Vec<_>) =
            messages.iter().cloned().partition(|m| m.is_system());
        ContextBudget {
            total: self.context_window,
            system: self.estimate(&system),
            conversation: self.estimate(&rest),
            prune_threshold: self.prune_threshold(),
        }
    }
}

// ─── Usage Warnings ─────────────────────────────────────────────────────────

/// Remembers which warning thresholds already fired, per limit.
#[derive(Debug, Default)]
pub struct UsageWarnings {
    /// Limit name → highest threshold already reported.
    fired: HashMap<String, u8>,
}

impl UsageWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the highest threshold newly crossed by `percent`, if any.
    ///
    /// Lower thresholds crossed in the same jump are marked as fired without
    /// a separate report, so each threshold is reported at most once.
    pub fn crossed(&mut self, limit: &str, percent: f64) -> Option<u8> {
        let highest = WARNING_THRESHOLDS
            .iter()
            .rev()
            .copied()
            .find(|t| percent >= f64::from(*t))?;

        let previous = self.fired.get(limit).copied().unwrap_or(0);
        if highest <= previous {
            return None;
        }
        self.fired.insert(limit.to_string(), highest);
        Some(highest)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::tokens::HeuristicEstimator;

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(HeuristicEstimator), "test-model")
    }

    fn conversation(turns: usize, chars: usize) -> Vec<ConversationMessage> {
        let mut messages = vec![ConversationMessage::system("You are a coding assistant.")];
        for i in 0..turns {
            messages.push(ConversationMessage::user(format!("{i}:{}", "u".repeat(chars))));
            messages.push(ConversationMessage::assistant(format!("{i}:{}", "a".repeat(chars))));
        }
        messages
    }

    #[test]
    fn test_within_budget_is_untouched() {
        let mut messages = conversation(3, 20);
        let before = messages.clone();
        let report = manager().prune(&mut messages);
        assert_eq!(report.removed, 0);
        assert_eq!(report.policy, PrunePolicy::None);
        assert_eq!(report.tokens_before, report.tokens_after);
        assert_eq!(messages, before);
    }

    #[test]
    fn test_count_cap_keeps_system_and_newest() {
        let mut messages = conversation(10, 10);
        let report = manager().with_max_messages(4).prune(&mut messages);

        assert_eq!(report.removed, 16);
        assert_eq!(report.policy, PrunePolicy::MessageCount);
        assert_eq!(messages.len(), 5);
        assert!(messages[0].is_system());
        assert!(messages[1].content.starts_with("8:"));
        assert!(messages[4].content.starts_with("9:"));
    }

    #[test]
    fn test_token_budget_drops_oldest_first() {
        // Window 1000 * 0.7 = 700 tokens allowed; each turn ~2 * (4 + 32).
        let mut messages = conversation(20, 100);
        let mgr = manager().with_context_window(1000);
        let report = mgr.prune(&mut messages);

        assert_eq!(report.policy, PrunePolicy::TokenBudget);
        assert!(report.tokens_after <= mgr.prune_threshold());
        assert!(report.tokens_before > report.tokens_after);
        assert!(messages[0].is_system());
        assert!(messages.last().unwrap().content.starts_with("19:"));
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mgr = manager().with_context_window(1000).with_max_messages(12);
        let mut once = conversation(20, 100);
        mgr.prune(&mut once);
        let mut twice = once.clone();
        let second = mgr.prune(&mut twice);

        assert_eq!(second.removed, 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_system_message_survives_any_prune() {
        let mgr = manager()
            .with_context_window(64)
            .with_max_messages(1)
            .with_keep_recent(1);
        let mut messages = conversation(5, 200);
        for _ in 0..3 {
            mgr.prune(&mut messages);
            assert!(messages[0].is_system());
            assert_eq!(messages[0].content, "You are a coding assistant.");
        }
    }

    #[test]
    fn test_keep_recent_is_never_dropped() {
        // Budget too small even for the two newest messages.
        let mgr = manager().with_context_window(10).with_keep_recent(2);
        let mut messages = conversation(3, 300);
        let report = mgr.prune(&mut messages);

        assert_eq!(messages.len(), 3);
        assert!(messages[1].content.starts_with("2:"));
        assert!(report.tokens_after > mgr.prune_threshold());
    }

    #[test]
    fn test_recovery_notes_are_not_pruned() {
        let mut messages = conversation(6, 10);
        messages.insert(3, ConversationMessage::recovery_note("previous reply failed"));
        manager().with_max_messages(2).prune(&mut messages);
        assert!(messages.iter().any(|m| m.content == "previous reply failed"));
    }

    #[test]
    fn test_budget_splits_system_and_conversation() {
        let messages = conversation(1, 10);
        let budget = manager().budget(&messages);
        assert!(budget.system > 0);
        assert!(budget.conversation > 0);
        assert_eq!(budget.total, DEFAULT_CONTEXT_WINDOW);
        assert_eq!(budget.prune_threshold, 22_937);
    }

    #[test]
    fn test_warning_thresholds_fire_once() {
        let mut warnings = UsageWarnings::new();
        assert_eq!(warnings.crossed("tokens", 50.0), None);
        assert_eq!(warnings.crossed("tokens", 86.0), Some(85));
        assert_eq!(warnings.crossed("tokens", 87.0), None);
        assert_eq!(warnings.crossed("tokens", 96.0), Some(95));
        // 90 was skipped over and never reported separately.
        assert_eq!(warnings.crossed("tokens", 97.0), None);
        assert_eq!(warnings.crossed("tokens", 99.5), Some(99));
        assert_eq!(warnings.crossed("tokens", 100.0), None);
        // Limits are tracked independently.
        assert_eq!(warnings.crossed("cost", 90.0), Some(90));
    }
}
