//! Engine events — informational notifications for front-ends.
//!
//! The engine never renders anything. It emits [`EngineEvent`]s to an
//! [`EventSink`] and leaves presentation to the subscriber. Events never
//! influence the engine's decisions; a sink that drops them is fine.

use serde::Serialize;
use tokio::sync::mpsc;

/// Coarse engine state for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineStatus {
    Thinking,
    RunningTools,
    WaitingForUser,
    Idle,
    Aborted,
}

/// Structured event emitted during `process_message`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    /// A model turn is about to be requested (1-based).
    TurnStarted { iteration: u32 },
    /// Visible narration from the streaming decoder.
    Chunk { text: String },
    ToolStarted {
        call_id: String,
        tool: String,
        /// Runs in the concurrent read-only group.
        parallel: bool,
    },
    /// Progress or side information for a running tool (cache hit,
    /// confirmation outcome, truncation).
    ToolUpdated {
        call_id: String,
        tool: String,
        message: String,
    },
    ToolEnded {
        call_id: String,
        tool: String,
        success: bool,
        cached: bool,
        duration_ms: u64,
    },
    Status { status: EngineStatus },
    /// Session usage crossed a warning threshold (percent).
    Warning { message: String, threshold: u8 },
    Error { message: String },
    /// The context manager dropped messages before a model turn.
    Pruned {
        removed: usize,
        tokens_before: u32,
        tokens_after: u32,
    },
    /// Related tests ran after source files changed.
    TestsRan { summary: String },
}

/// Observer for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

impl<F> EventSink for F
where
    F: Fn(EngineEvent) + Send + Sync,
{
    fn emit(&self, event: EngineEvent) {
        self(event)
    }
}

impl EventSink for mpsc::UnboundedSender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        // Receiver gone means nobody is listening.
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::Sender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.try_send(event) {
            tracing::debug!(error = %e, "event dropped");
        }
    }
}

/// Sink used when the caller passes none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: EngineEvent) {}
}

// ─── Tests ──────────────────────────────────────────────────────────────────
