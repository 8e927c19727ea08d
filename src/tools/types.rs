//! Tool handler seam and the types that travel across it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::inference::types::ToolCall;

use super::errors::ToolError;

// ─── Classification ─────────────────────────────────────────────────────────

/// How a tool may be scheduled. Declared once, at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// No side effects. Runs concurrently with other read-only calls and its
    /// results may be cached.
    ReadOnly,
    /// Side effects that need no rollback protection (e.g. asking the user).
    /// Runs on the sequential path.
    Sequential,
    /// Mutates the working tree or external state. Runs on the sequential
    /// path inside a checkpoint and may require confirmation.
    Destructive,
}

impl ToolCategory {
    pub fn is_parallel_safe(self) -> bool {
        matches!(self, ToolCategory::ReadOnly)
    }
}

/// Shape of a tool's output, for feedback post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Plain,
    /// Contents of a single file; tracked by the file registry and truncated.
    FileContent,
    /// A directory listing or search hits; truncated.
    Listing,
}

impl OutputKind {
    /// Read-style outputs get the character/line ceiling.
    pub fn is_truncatable(self) -> bool {
        matches!(self, OutputKind::FileContent | OutputKind::Listing)
    }
}

/// Static description of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    #[serde(default)]
    pub output_kind: OutputKind,
    /// Dispatching this tool ends the turn (the model is waiting on the user).
    #[serde(default)]
    pub stops_turn: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category,
            output_kind: OutputKind::Plain,
            stops_turn: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn output(mut self, kind: OutputKind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn stopping(mut self) -> Self {
        self.stops_turn = true;
        self
    }
}

// ─── Execution ──────────────────────────────────────────────────────────────

/// What a tool hands back. `Error` is an expected, model-readable failure;
/// unexpected failures are returned as `Err` from [`ToolHandler::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Success(String),
    Error(String),
}

/// User-confirmation collaborator.
///
/// Callable from inside a sequential tool execution; the engine waits for
/// the answer without a timeout.
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Ask `message`, offering `choices`; return the chosen value.
    async fn prompt(&self, message: &str, choices: &[&str], default: &str) -> String;
}

/// Per-dispatch environment handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub confirmer: Option<Arc<dyn Confirmer>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("working_dir", &self.working_dir)
            .field("confirmer", &self.confirmer.is_some())
            .finish()
    }
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// Fetch a parameter the tool cannot run without.
pub fn required_param<'a>(call: &'a ToolCall, key: &str) -> Result<&'a str, ToolError> {
    call.param(key).ok_or_else(|| ToolError::MissingParameter {
        tool: call.name.clone(),
        name: key.to_string(),
    })
}
