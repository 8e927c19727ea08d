//! Tool error types.
//!
//! None of these escape the dispatcher: each is rendered into a failure
//! result the model reads in its next turn.

use thiserror::Error;

/// Errors raised around tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No handler registered under this name.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// A required parameter is absent.
    #[error("{tool}: missing required parameter '{name}'")]
    MissingParameter { tool: String, name: String },

    /// A parameter is present but unusable.
    #[error("{tool}: invalid parameter '{name}': {reason}")]
    InvalidParameter {
        tool: String,
        name: String,
        reason: String,
    },

    /// The tool did not finish within the per-call timeout.
    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    /// The user declined to run the tool.
    #[error("user rejected the '{tool}' call")]
    Rejected { tool: String },

    /// The implementation panicked.
    #[error("{tool} crashed: {reason}")]
    Panicked { tool: String, reason: String },
}
