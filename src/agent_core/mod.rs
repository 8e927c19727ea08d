//! Agent Core — orchestration layer for devloop.
//!
//! Submodules:
//! - `engine`: The turn orchestrator (`Engine::process_message`)
//! - `tool_router`: Classifies and dispatches a turn's tool calls
//! - `checkpoint`: Checkpoint/rollback transaction around destructive batches
//! - `git_snapshots`: Git stash snapshot backend
//! - `conversation`: Context budget, pruning, usage warnings
//! - `tokens`: Token estimation for context window budgets
//! - `result_cache`: TTL cache for read-only tool results
//! - `file_registry`: Content-hash ledger of files the model has read
//! - `permissions`: Session grants for destructive tools
//! - `response_analysis`: Question and completion detection
//! - `events`: Observer events and sinks
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod checkpoint;
pub mod conversation;
pub mod engine;
pub mod errors;
pub mod events;
pub mod file_registry;
pub mod git_snapshots;
pub mod permissions;
pub mod response_analysis;
pub mod result_cache;
pub mod tokens;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, SnapshotBackend};
pub use conversation::{ContextManager, PruneReport};
pub use engine::{AbortHandle, Collaborators, Engine, RelatedTests};
pub use errors::{AgentError, CheckpointError};
pub use events::{EngineEvent, EngineStatus, EventSink, NoopSink};
pub use file_registry::FileRegistry;
pub use git_snapshots::GitSnapshots;
pub use permissions::PermissionStore;
pub use result_cache::ResultCache;
pub use tokens::{HeuristicEstimator, TokenEstimator};
pub use tool_router::{DispatchReport, ToolDispatcher};
pub use types::{
    ConfirmationChoice, ContextBudget, ConversationMessage, MessageKind, SessionMetrics,
    ToolOutcome, ToolResult,
};
