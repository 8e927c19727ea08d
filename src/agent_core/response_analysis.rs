//! Response analysis for the agent loop.
//!
//! Detects when a model turn should end the loop before any tool runs: the
//! model asked the user something, or announced that the work is finished.
//! A match takes precedence over tool markup in the same response, so the
//! agent never asks a question and then acts as though it had been answered.
//!
//! Input is the turn's narration (the raw response with tool elements
//! removed). Fenced code blocks are skipped so source code cannot trigger a
//! stop.

use std::sync::LazyLock;

use regex::Regex;

/// Why a response ends the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model asked the user a direct question.
    Question,
    /// The model announced the task is complete.
    Completion,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Question => "question",
            StopReason::Completion => "completion",
        }
    }
}

static QUESTION_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(would you like|should i|please confirm|do you want me to|shall i|could you (?:tell|confirm|clarify))\b",
    )
    .expect("question pattern compiles")
});

static COMPLETION_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(the (?:app|application|server|project) is (?:now )?ready|you can now|all done|(?:the )?task is (?:now )?complete)",
    )
    .expect("completion pattern compiles")
});

static DONE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[*_#>\-\s]*)Done\b").expect("done pattern compiles")
});

/// Decide whether a response stops the loop. Questions win over completion.
pub fn detect_stop(narration: &str) -> Option<StopReason> {
    let prose = prose_lines(narration);
    if is_direct_question(&prose) {
        Some(StopReason::Question)
    } else if is_completion_announcement(&prose) {
        Some(StopReason::Completion)
    } else {
        None
    }
}

/// Any line ending in `?`, or an explicit ask-the-user phrase.
fn is_direct_question(lines: &[&str]) -> bool {
    lines
        .iter()
        .any(|line| line.trim_end().ends_with('?') || QUESTION_PHRASES.is_match(line))
}

fn is_completion_announcement(lines: &[&str]) -> bool {
    lines
        .iter()
        .any(|line| COMPLETION_PHRASES.is_match(line) || DONE_LINE.is_match(line.trim_start()))
}

/// Lines outside ``` fences.
fn prose_lines(text: &str) -> Vec<&str> {
    let mut in_fence = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            lines.push(line);
        }
    }
    lines
}

// ─── Tests ──────────────────────────────────────────────────────────────────
