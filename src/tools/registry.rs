//! Tool registry — `name → handler` map populated at startup.
//!
//! Provides:
//! - Handler lookup by name
//! - Category lookup for scheduling (unknown names are sequential)
//! - A capability summary for the system prompt
//! - The builtin `wait_for_user` tool

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::inference::types::ToolCall;

use super::types::{ToolCategory, ToolContext, ToolHandler, ToolOutput, ToolSpec};

/// Name of the builtin tool the model calls when it needs the user to act.
pub const WAIT_FOR_USER: &str = "wait_for_user";

// ─── ToolRegistry ────────────────────────────────────────────────────────────

#[derive(Clone)]
struct RegisteredTool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of tool handlers keyed by name.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a registry holding only the builtin `wait_for_user` tool.
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(Arc::new(WaitForUser));
        registry
    }

    /// Register a handler under its spec's name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let spec = handler.spec();
        tracing::debug!(tool = %spec.name, category = ?spec.category, "registering tool");
        if let Some(previous) = self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                spec: spec.clone(),
                handler,
            },
        ) {
            tracing::warn!(tool = %previous.spec.name, "tool registration replaced");
        }
    }

    /// Builder-style registration.
    pub fn with(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Remove a tool. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|t| Arc::clone(&t.handler))
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| &t.spec)
    }

    /// Scheduling category; unknown names take the sequential path.
    pub fn category(&self, name: &str) -> ToolCategory {
        self.spec(name)
            .map(|s| s.category)
            .unwrap_or(ToolCategory::Sequential)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Describe the available tools and the markup protocol for the system prompt.
    pub fn capability_summary(&self) -> String {
        let mut out = String::from(
            "Call tools by writing markup in your reply:\n\
             <tool name=\"TOOL\" param=\"value\"/> or\n\
             <tool name=\"TOOL\" param=\"value\">inline content</tool>\n\n\
             Available tools:\n",
        );
        for name in self.tool_names() {
            let Some(spec) = self.spec(name) else {
                continue;
            };
            let kind = match spec.category {
                ToolCategory::ReadOnly => "read-only",
                ToolCategory::Sequential => "sequential",
                ToolCategory::Destructive => "modifies files",
            };
            if spec.description.is_empty() {
                out.push_str(&format!("- {name} ({kind})\n"));
            } else {
                out.push_str(&format!("- {name} ({kind}): {}\n", spec.description));
            }
        }
        out
    }
}

// ─── Builtins ────────────────────────────────────────────────────────────────

/// Signals that the model is blocked on the user; dispatching it ends the turn.
struct WaitForUser;

#[async_trait]
impl ToolHandler for WaitForUser {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(WAIT_FOR_USER, ToolCategory::Sequential)
            .describe("Pause and hand control back to the user. Optional `message`.")
            .stopping()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let message = call.param("message").unwrap_or("waiting for the user");
        Ok(ToolOutput::Success(format!("Paused: {message}")))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
