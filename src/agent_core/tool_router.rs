//! ToolDispatcher — executes one model turn's batch of tool calls.
//!
//! The dispatcher is the bridge between the model's tool-call markup and the
//! registered tool handlers. It handles:
//! - Classification via the registry (read-only vs sequential vs destructive)
//! - Concurrent execution of read-only calls, with result caching
//! - In-order execution of everything else
//! - One checkpoint around a sequential batch containing a destructive call,
//!   rolled back on the first destructive failure
//! - Confirmation flow for destructive calls, with session grants
//! - Per-call timeouts, panic isolation, and output truncation
//!
//! Tool failures never escape: they become failure results the model can read.
//! Only checkpoint errors are returned to the caller.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::agent_core::tokens::truncate_utf8;
use crate::inference::types::ToolCall;
use crate::tools::{OutputKind, ToolCategory, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolSpec};

use super::checkpoint::CheckpointStore;
use super::errors::CheckpointError;
use super::events::{EngineEvent, EventSink};
use super::file_registry::{FileRegistry, UNCHANGED_NOTE};
use super::permissions::{PermissionStatus, PermissionStore};
use super::result_cache::ResultCache;
use super::types::{ConfirmationChoice, ToolOutcome, ToolResult};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Character ceiling for file-content and listing outputs.
pub const MAX_OUTPUT_CHARS: usize = 12_000;

/// Line ceiling for file-content and listing outputs.
pub const MAX_OUTPUT_LINES: usize = 400;

/// Default per-call execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Dispatch Report ────────────────────────────────────────────────────────

/// Everything one dispatch produced, in feedback order.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Read-only results in completion order, then sequential results in
    /// invocation order.
    pub results: Vec<ToolResult>,
    /// Batch-level notes (rollback, skipped calls, abort).
    pub notes: Vec<String>,
    pub rolled_back: bool,
    /// A dispatched tool asked to end the turn.
    pub stop_requested: bool,
    /// Paths written by successful destructive calls that were kept.
    pub changed_paths: Vec<String>,
    /// Cancellation interrupted the batch.
    pub aborted: bool,
}

impl DispatchReport {
    /// Handler invocations, excluding cache hits.
    pub fn executed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.cached).count()
    }

    /// The synthetic user message fed back to the model.
    pub fn feedback_message(&self) -> String {
        let mut sections: Vec<String> = self.results.iter().map(ToolResult::render).collect();
        sections.extend(self.notes.iter().map(|n| format!("Note: {n}")));
        sections.join("\n\n")
    }
}

// ─── ToolDispatcher ─────────────────────────────────────────────────────────

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    checkpoints: Arc<CheckpointStore>,
    cache: Arc<ResultCache>,
    files: Arc<FileRegistry>,
    /// Only touched from the sequential path; never held across an await.
    permissions: Mutex<PermissionStore>,
    ctx: ToolContext,
    tool_timeout: Duration,
    require_confirmation: bool,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        checkpoints: Arc<CheckpointStore>,
        ctx: ToolContext,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            cache: Arc::new(ResultCache::default()),
            files: Arc::new(FileRegistry::new()),
            permissions: Mutex::new(PermissionStore::new()),
            ctx,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            require_confirmation: true,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_file_registry(mut self, files: Arc<FileRegistry>) -> Self {
        self.files = files;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_confirmation(mut self, required: bool) -> Self {
        self.require_confirmation = required;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn file_registry(&self) -> &FileRegistry {
        &self.files
    }

    /// Forget every "allow for session" answer.
    pub fn clear_session_grants(&self) {
        self.lock_permissions().clear_session();
    }

    fn lock_permissions(&self) -> std::sync::MutexGuard<'_, PermissionStore> {
        self.permissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Run a batch. Read-only calls first (concurrently), then the rest in order.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, CheckpointError> {
        let mut report = DispatchReport::default();
        if calls.is_empty() {
            return Ok(report);
        }

        let (parallel, sequential): (Vec<&ToolCall>, Vec<&ToolCall>) = calls
            .iter()
            .partition(|c| self.registry.category(&c.name).is_parallel_safe());

        tracing::info!(
            total = calls.len(),
            parallel = parallel.len(),
            sequential = sequential.len(),
            "dispatching tool batch"
        );

        self.run_parallel(&parallel, events, cancel, &mut report).await;
        if report.aborted {
            let planned: Vec<&str> = sequential.iter().map(|c| c.name.as_str()).collect();
            if !planned.is_empty() {
                report.notes.push(format!(
                    "Aborted before running: {}.",
                    planned.join(", ")
                ));
            }
            return Ok(report);
        }

        self.run_sequential(&sequential, events, cancel, &mut report)
            .await?;
        Ok(report)
    }

    async fn run_parallel(
        &self,
        calls: &[&ToolCall],
        events: &dyn EventSink,
        cancel: &CancellationToken,
        report: &mut DispatchReport,
    ) {
        if calls.is_empty() {
            return;
        }

        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .map(|call| self.run_read_only(call, events))
            .collect();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(unfinished = pending.len(), "read-only group aborted");
                    report.aborted = true;
                    break;
                }
                next = pending.next() => match next {
                    Some(result) => report.results.push(result),
                    None => break,
                },
            }
        }
    }

    async fn run_read_only(&self, call: &ToolCall, events: &dyn EventSink) -> ToolResult {
        events.emit(EngineEvent::ToolStarted {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            parallel: true,
        });
        let start = Instant::now();
        let params = call.serialized_parameters();

        if let Some(text) = self.cache.get(&call.name, &params) {
            events.emit(EngineEvent::ToolUpdated {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                message: "served from cache".to_string(),
            });
            return self.finish(call, ToolOutcome::Success(text), true, start, events);
        }

        let spec = self.registry.spec(&call.name).cloned();
        let outcome = self.invoke(call).await;
        let outcome = match outcome {
            ToolOutcome::Success(text) => {
                let (text, annotated) = self.post_process(call, spec.as_ref(), text, events);
                self.cache
                    .put_with_paths(&call.name, &params, &call.paths(), text.clone());
                ToolOutcome::Success(annotate(text, annotated))
            }
            failure => failure,
        };
        self.finish(call, outcome, false, start, events)
    }

    async fn run_sequential(
        &self,
        calls: &[&ToolCall],
        events: &dyn EventSink,
        cancel: &CancellationToken,
        report: &mut DispatchReport,
    ) -> Result<(), CheckpointError> {
        if calls.is_empty() {
            return Ok(());
        }

        let destructive = calls
            .iter()
            .any(|c| self.registry.category(&c.name) == ToolCategory::Destructive);
        if destructive {
            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            self.checkpoints
                .checkpoint(&format!("before {}", names.join(",")))
                .await?;
        }

        let mut changed: Vec<String> = Vec::new();

        for (index, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                report.aborted = true;
                note_unexecuted(report, "Aborted before running", &calls[index..]);
                break;
            }

            let category = self.registry.category(&call.name);
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                step = self.run_one_sequential(call, category, events) => Some(step),
            };
            let Some(step) = step else {
                report.aborted = true;
                note_unexecuted(report, "Aborted before finishing", &calls[index..]);
                break;
            };

            if self
                .registry
                .spec(&call.name)
                .is_some_and(|spec| spec.stops_turn)
            {
                report.stop_requested = true;
            }

            let failed = !step.result.is_success();
            let failed_tool = step.result.tool_name.clone();
            report.results.push(step.result);

            if category == ToolCategory::Destructive && !failed {
                let paths = call.paths();
                if paths.is_empty() {
                    // No way to tell what it touched.
                    self.cache.clear();
                }
                for path in paths {
                    self.cache.invalidate_path(path);
                    self.files.forget(path);
                    changed.push(path.to_string());
                }
            }

            if category == ToolCategory::Destructive && failed && !step.rejected {
                tracing::warn!(tool = %failed_tool, "destructive call failed, rolling back batch");
                self.checkpoints.rollback().await?;
                self.cache.clear();
                self.files.clear();
                report.rolled_back = true;
                changed.clear();

                report.notes.push(format!(
                    "'{failed_tool}' failed, so every change made by this batch was rolled back. \
                     The working tree is back to its state before the batch."
                ));
                note_unexecuted(report, "Skipped (not executed)", &calls[index + 1..]);
                return Ok(());
            }
        }

        if report.aborted {
            if self.checkpoints.rollback().await? {
                report.rolled_back = true;
                self.cache.clear();
                self.files.clear();
                report
                    .notes
                    .push("The batch was aborted; its changes were rolled back.".to_string());
            }
            return Ok(());
        }

        if destructive {
            self.checkpoints.commit().await?;
        }
        report.changed_paths.extend(changed);
        Ok(())
    }

    async fn run_one_sequential(
        &self,
        call: &ToolCall,
        category: ToolCategory,
        events: &dyn EventSink,
    ) -> SequentialStep {
        events.emit(EngineEvent::ToolStarted {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            parallel: false,
        });
        let start = Instant::now();

        if category == ToolCategory::Destructive && !self.confirm(call, events).await {
            let reason = ToolError::Rejected {
                tool: call.name.clone(),
            }
            .to_string();
            return SequentialStep {
                result: self.finish(call, ToolOutcome::Failure(reason), false, start, events),
                rejected: true,
            };
        }

        let spec = self.registry.spec(&call.name).cloned();
        let outcome = match self.invoke(call).await {
            ToolOutcome::Success(text) => {
                let (text, annotated) = self.post_process(call, spec.as_ref(), text, events);
                ToolOutcome::Success(annotate(text, annotated))
            }
            failure => failure,
        };

        SequentialStep {
            result: self.finish(call, outcome, false, start, events),
            rejected: false,
        }
    }

    /// Ask the confirmer unless confirmation is off, absent, or already granted.
    async fn confirm(&self, call: &ToolCall, events: &dyn EventSink) -> bool {
        if !self.require_confirmation {
            return true;
        }
        let Some(confirmer) = self.ctx.confirmer.clone() else {
            return true;
        };
        if self.lock_permissions().check(&call.name) == PermissionStatus::Allowed {
            tracing::debug!(tool = %call.name, "skipping confirmation, permission granted");
            return true;
        }

        let message = format!("Allow {}?\n{}", call.name, generate_preview(call));
        let answer = confirmer
            .prompt(
                &message,
                &ConfirmationChoice::PROMPT_CHOICES,
                ConfirmationChoice::PROMPT_DEFAULT,
            )
            .await;

        let choice = ConfirmationChoice::from_answer(&answer);
        tracing::info!(tool = %call.name, choice = ?choice, "confirmation answered");
        let message = match choice {
            ConfirmationChoice::Once => "approved by user",
            ConfirmationChoice::ForSession => {
                self.lock_permissions().grant_for_session(&call.name);
                "approved by user for this session"
            }
            ConfirmationChoice::Reject => "rejected by user",
        };
        events.emit(EngineEvent::ToolUpdated {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            message: message.to_string(),
        });
        choice != ConfirmationChoice::Reject
    }

    /// Run a handler under the timeout, converting every failure mode to text.
    async fn invoke(&self, call: &ToolCall) -> ToolOutcome {
        let Some(handler) = self.registry.handler(&call.name) else {
            tracing::warn!(tool = %call.name, "unknown tool requested");
            return ToolOutcome::Failure(
                ToolError::UnknownTool {
                    name: call.name.clone(),
                }
                .to_string(),
            );
        };

        let execution = AssertUnwindSafe(handler.execute(call, &self.ctx)).catch_unwind();
        match tokio::time::timeout(self.tool_timeout, execution).await {
            Err(_) => {
                tracing::warn!(tool = %call.name, timeout_secs = self.tool_timeout.as_secs(), "tool timed out");
                ToolOutcome::Failure(
                    ToolError::Timeout {
                        tool: call.name.clone(),
                        timeout_secs: self.tool_timeout.as_secs(),
                    }
                    .to_string(),
                )
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(tool = %call.name, reason = %reason, "tool panicked");
                ToolOutcome::Failure(
                    ToolError::Panicked {
                        tool: call.name.clone(),
                        reason,
                    }
                    .to_string(),
                )
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(tool = %call.name, error = %e, "tool returned an error");
                ToolOutcome::Failure(format!("{e:#}"))
            }
            Ok(Ok(Ok(ToolOutput::Success(text)))) => ToolOutcome::Success(text),
            Ok(Ok(Ok(ToolOutput::Error(text)))) => ToolOutcome::Failure(text),
        }
    }

    /// Truncate read-style output and check re-reads against the file registry.
    /// Returns the text to cache and whether it should be annotated unchanged.
    fn post_process(
        &self,
        call: &ToolCall,
        spec: Option<&ToolSpec>,
        text: String,
        events: &dyn EventSink,
    ) -> (String, bool) {
        let kind = spec.map(|s| s.output_kind).unwrap_or_default();

        let unchanged = match (kind, call.path()) {
            (OutputKind::FileContent, Some(path)) => self.files.observe(path, &text).unchanged,
            _ => false,
        };

        if !kind.is_truncatable() {
            return (text, unchanged);
        }
        match truncate_read_output(&text) {
            Some(truncated) => {
                events.emit(EngineEvent::ToolUpdated {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    message: format!("output truncated ({} chars)", text.chars().count()),
                });
                (truncated, unchanged)
            }
            None => (text, unchanged),
        }
    }

    fn finish(
        &self,
        call: &ToolCall,
        outcome: ToolOutcome,
        cached: bool,
        start: Instant,
        events: &dyn EventSink,
    ) -> ToolResult {
        let duration_ms = start.elapsed().as_millis() as u64;
        let success = matches!(outcome, ToolOutcome::Success(_));

        tracing::info!(
            tool = %call.name,
            call_id = %call.id,
            success,
            cached,
            duration_ms,
            "tool finished"
        );
        if let ToolOutcome::Failure(reason) = &outcome {
            tracing::debug!(tool = %call.name, reason = %truncate_utf8(reason, 200), "tool failure");
        }

        events.emit(EngineEvent::ToolEnded {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success,
            cached,
            duration_ms,
        });

        ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome,
            cached,
            duration_ms,
        }
    }
}

struct SequentialStep {
    result: ToolResult,
    /// The user rejected the call; nothing ran.
    rejected: bool,
}

fn annotate(text: String, unchanged: bool) -> String {
    if unchanged {
        format!("{UNCHANGED_NOTE}\n{text}")
    } else {
        text
    }
}

fn note_unexecuted(report: &mut DispatchReport, prefix: &str, calls: &[&ToolCall]) {
    if calls.is_empty() {
        return;
    }
    let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
    report.notes.push(format!("{prefix}: {}.", names.join(", ")));
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Output Truncation ──────────────────────────────────────────────────────

/// Cut read-style output to [`MAX_OUTPUT_LINES`] lines and
/// [`MAX_OUTPUT_CHARS`] characters. `None` when it already fits.
pub fn truncate_read_output(text: &str) -> Option<String> {
    let total_chars = text.chars().count();
    let total_lines = text.lines().count();
    if total_chars <= MAX_OUTPUT_CHARS && total_lines <= MAX_OUTPUT_LINES {
        return None;
    }

    let mut kept = text;
    if total_lines > MAX_OUTPUT_LINES {
        if let Some((end, _)) = kept.match_indices('\n').nth(MAX_OUTPUT_LINES - 1) {
            kept = &kept[..end];
        }
    }
    if let Some((end, _)) = kept.char_indices().nth(MAX_OUTPUT_CHARS) {
        kept = &kept[..end];
    }

    let shown_lines = kept.lines().count();
    let shown_chars = kept.chars().count();
    tracing::debug!(total_chars, total_lines, shown_chars, shown_lines, "tool output truncated");

    Some(format!(
        "{kept}\n\n[... truncated: showing {shown_lines} of {total_lines} lines \
         ({shown_chars} of {total_chars} characters). {omitted_lines} lines were omitted; \
         use a narrower tool (search, or read a specific line range) instead of reading everything.]",
        omitted_lines = total_lines.saturating_sub(shown_lines),
    ))
}

// ─── Confirmation Preview ───────────────────────────────────────────────────

/// Human-readable one-line summary of a destructive call.
pub fn generate_preview(call: &ToolCall) -> String {
    let param = |key: &str| call.param(key).unwrap_or("<unknown>");

    match call.name.as_str() {
        "write_file" | "create_file" => match &call.inline_content {
            Some(content) => format!(
                "Write to file: {} ({} lines)",
                param("path"),
                content.lines().count()
            ),
            None => format!("Write to file: {}", param("path")),
        },
        "edit_file" | "replace_in_file" => format!("Edit file: {}", param("path")),
        "delete_file" => format!("Delete file: {}", param("path")),
        "move_file" | "rename_file" => {
            format!("Move: {} → {}", param("source"), param("destination"))
        }
        "run_command" | "shell" => format!("Run command: {}", param("command")),
        _ => {
            let params: Vec<String> = call
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={}", truncate_utf8(v, 60)))
                .collect();
            if params.is_empty() {
                format!("Run {}", call.name)
            } else {
                format!("Run {} ({})", call.name, params.join(", "))
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
