//! Shared types for the agent core.
//!
//! Conversation messages, tool results, session metrics, and confirmation
//! types used across the engine, dispatcher, and context manager.

use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Role};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// Why a message is in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// System prompt.
    Prompt,
    /// Text typed by the user.
    UserInput,
    /// A model turn (raw, markup included).
    Narration,
    /// Synthetic user-role message carrying tool results.
    ToolFeedback,
    /// System note injected after a model failure.
    RecoveryNote,
}

/// A single message in conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub kind: MessageKind,
}

impl ConversationMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            kind: MessageKind::Prompt,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            kind: MessageKind::UserInput,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            kind: MessageKind::Narration,
        }
    }

    pub fn tool_feedback(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            kind: MessageKind::ToolFeedback,
        }
    }

    pub fn recovery_note(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            kind: MessageKind::RecoveryNote,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

// ─── Tool Results ───────────────────────────────────────────────────────────

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(String),
    Failure(String),
}

/// A tool call's result, as placed in the feedback message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
    /// Served from the result cache.
    pub cached: bool,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success(_))
    }

    pub fn text(&self) -> &str {
        match &self.outcome {
            ToolOutcome::Success(t) | ToolOutcome::Failure(t) => t,
        }
    }

    /// Render this result as one section of the feedback message.
    pub fn render(&self) -> String {
        let cached = if self.cached { " (cached)" } else { "" };
        match &self.outcome {
            ToolOutcome::Success(text) => {
                format!("Result of {}{cached}:\n{text}", self.tool_name)
            }
            ToolOutcome::Failure(reason) => {
                format!("Result of {}: FAILED\n{reason}", self.tool_name)
            }
        }
    }
}

// ─── Session Metrics ────────────────────────────────────────────────────────

/// Running totals for the engine's lifetime. Only ever increases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_total: f64,
    pub iterations: u64,
    pub tools_executed: u64,
}

impl SessionMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ─── Context Budget ─────────────────────────────────────────────────────────

/// Snapshot of context window usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBudget {
    /// Context window of the model, in tokens.
    pub total: u32,
    /// Tokens used by system messages.
    pub system: u32,
    /// Tokens used by the rest of the conversation.
    pub conversation: u32,
    /// Usage above which pruning starts.
    pub prune_threshold: u32,
}

impl ContextBudget {
    pub fn used(&self) -> u32 {
        self.system + self.conversation
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.used())
    }
}

// ─── Confirmation ───────────────────────────────────────────────────────────

/// The user's answer to a destructive-action prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationChoice {
    /// Run this call.
    Once,
    /// Run this call and stop asking for this tool until the engine is dropped.
    ForSession,
    Reject,
}

impl ConfirmationChoice {
    /// Choices offered to the confirmer, in display order.
    pub const PROMPT_CHOICES: [&'static str; 3] = ["yes", "always", "no"];

    /// Default answer when the user just presses enter.
    pub const PROMPT_DEFAULT: &'static str = "no";

    /// Interpret a confirmer's answer. Anything unrecognized is a rejection.
    pub fn from_answer(answer: &str) -> Self {
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "once" => ConfirmationChoice::Once,
            "a" | "always" | "session" => ConfirmationChoice::ForSession,
            _ => ConfirmationChoice::Reject,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
