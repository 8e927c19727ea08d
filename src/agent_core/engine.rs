//! Engine — the turn orchestrator.
//!
//! One `process_message` call runs the loop:
//!
//! 1. append the user message and prune the context
//! 2. enforce session ceilings (tokens, cost) and emit usage warnings
//! 3. stream a model turn through the [`TagFilter`], emitting narration
//! 4. stop early when the narration asks the user something or announces
//!    completion, even if tool markup follows
//! 5. parse tool calls; none means the turn is final
//! 6. dispatch the batch and feed all results back as one message
//! 7. repeat until stopped or `max_iterations` is reached
//!
//! Collaborators (model, tools, snapshot backend, token estimator,
//! confirmer, related-test runner) are injected through [`Collaborators`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::inference::types::{ChatMessage, RequestOptions};
use crate::inference::{parse_tool_calls, InferenceError, ModelClient, TagFilter};
use crate::tools::{Confirmer, ToolContext, ToolRegistry};

use super::checkpoint::{CheckpointStore, SnapshotBackend};
use super::conversation::{ContextManager, UsageWarnings};
use super::errors::AgentError;
use super::events::{EngineEvent, EngineStatus, EventSink, NoopSink};
use super::file_registry::FileRegistry;
use super::response_analysis::{detect_stop, StopReason};
use super::result_cache::ResultCache;
use super::tokens::TokenEstimator;
use super::tool_router::ToolDispatcher;
use super::types::{ConversationMessage, SessionMetrics};

// ─── Collaborators ──────────────────────────────────────────────────────────

/// Runs the tests related to a set of changed files.
#[async_trait]
pub trait RelatedTests: Send + Sync {
    /// Returns a short summary, or `None` when no test covers the paths.
    async fn run_related(&self, changed_paths: &[String]) -> anyhow::Result<Option<String>>;
}

/// Everything the engine depends on but does not own the implementation of.
pub struct Collaborators {
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<ToolRegistry>,
    pub snapshots: Arc<dyn SnapshotBackend>,
    pub estimator: Arc<dyn TokenEstimator>,
    pub confirmer: Option<Arc<dyn Confirmer>>,
    pub related_tests: Option<Arc<dyn RelatedTests>>,
    /// Project root handed to every tool.
    pub working_dir: PathBuf,
}

// ─── AbortHandle ────────────────────────────────────────────────────────────

/// Cancels the `process_message` call in flight.
///
/// Cloneable and usable from another task while the engine is borrowed
/// mutably. Each call gets a fresh token, so an abort never leaks into the
/// next call.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        tracing::info!("abort requested");
        self.lock().cancel();
    }

    fn reset(&self) -> CancellationToken {
        let mut current = self.lock();
        *current = CancellationToken::new();
        current.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// One model turn's output.
struct ModelTurn {
    /// Full response, markup included.
    raw: String,
    /// What the user saw.
    narration: String,
    aborted: bool,
}

/// How the loop ended.
enum LoopExit {
    /// Tool-free response or a stop heuristic.
    Finished,
    /// A dispatched tool asked to hand control back.
    WaitingForUser,
    MaxIterations,
    Aborted,
}

pub struct Engine {
    settings: EngineSettings,
    model: Arc<dyn ModelClient>,
    dispatcher: ToolDispatcher,
    context: ContextManager,
    related_tests: Option<Arc<dyn RelatedTests>>,
    messages: Vec<ConversationMessage>,
    metrics: SessionMetrics,
    warnings: UsageWarnings,
    abort: AbortHandle,
    initialized: bool,
}

impl Engine {
    pub fn new(settings: EngineSettings, collaborators: Collaborators) -> Self {
        let Collaborators {
            model,
            tools,
            snapshots,
            estimator,
            confirmer,
            related_tests,
            working_dir,
        } = collaborators;

        let checkpoints = Arc::new(CheckpointStore::new(snapshots));
        let ctx = ToolContext {
            working_dir,
            confirmer,
        };
        let dispatcher = ToolDispatcher::new(tools, checkpoints, ctx)
            .with_cache(Arc::new(ResultCache::new(
                settings.cache_ttl(),
                settings.cache_capacity,
            )))
            .with_file_registry(Arc::new(FileRegistry::new()))
            .with_timeout(settings.tool_timeout())
            .with_confirmation(settings.require_confirmation);

        let context = ContextManager::new(estimator, model.model_name())
            .with_context_window(model.context_window())
            .with_max_messages(settings.max_messages)
            .with_keep_recent(settings.keep_recent)
            .with_target_fraction(settings.prune_target_fraction);

        Self {
            settings,
            model,
            dispatcher,
            context,
            related_tests,
            messages: Vec::new(),
            metrics: SessionMetrics::default(),
            warnings: UsageWarnings::new(),
            abort: AbortHandle::default(),
            initialized: false,
        }
    }

    /// Reset the conversation to a single system message: the configured
    /// prompt, the tool capability summary, then `extra` if given.
    pub fn initialize(&mut self, extra: Option<&str>) {
        let mut prompt = self.settings.system_prompt.trim().to_string();
        let summary = self.dispatcher.registry().capability_summary();
        prompt.push_str("\n\n");
        prompt.push_str(summary.trim_end());
        if let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }

        self.messages = vec![ConversationMessage::system(prompt)];
        // A fresh conversation has not seen any file yet.
        self.dispatcher.file_registry().clear();
        self.initialized = true;

        tracing::info!(
            model = %self.model.model_name(),
            tool_count = self.dispatcher.registry().len(),
            prompt_tokens = self.context.estimate(&self.messages),
            "engine initialized"
        );
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.clone()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Forget every "allow for this session" answer given so far.
    pub fn clear_session_grants(&self) {
        self.dispatcher.clear_session_grants();
    }

    /// Run the agent loop for one user message.
    ///
    /// Returns the narration of every model turn, joined by blank lines. Tool
    /// failures never surface here; they are fed back to the model.
    pub async fn process_message(
        &mut self,
        text: &str,
        events: Option<&dyn EventSink>,
    ) -> Result<String, AgentError> {
        let sink: &dyn EventSink = events.unwrap_or(&NoopSink);
        if !self.initialized {
            self.initialize(None);
        }
        let cancel = self.abort.reset();

        self.messages.push(ConversationMessage::user(text));

        let mut narrations: Vec<String> = Vec::new();
        let mut changed_paths: Vec<String> = Vec::new();
        let result = self
            .run_loop(sink, &cancel, &mut narrations, &mut changed_paths)
            .await;

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(error = %e, "process_message failed");
                sink.emit(EngineEvent::Error {
                    message: e.to_string(),
                });
                sink.emit(EngineEvent::Status {
                    status: EngineStatus::Idle,
                });
                return Err(e);
            }
        };

        let status = match exit {
            LoopExit::Aborted => EngineStatus::Aborted,
            LoopExit::WaitingForUser => EngineStatus::WaitingForUser,
            LoopExit::Finished | LoopExit::MaxIterations => EngineStatus::Idle,
        };

        if let LoopExit::MaxIterations = exit {
            narrations.push(format!(
                "[Stopped after reaching the maximum of {} iterations. \
                 Send another message to continue.]",
                self.settings.max_iterations
            ));
        }

        if !matches!(exit, LoopExit::Aborted) {
            self.run_related_tests(&changed_paths, sink).await;
        }

        sink.emit(EngineEvent::Status { status });
        tracing::info!(
            iterations = self.metrics.iterations,
            tools_executed = self.metrics.tools_executed,
            total_tokens = self.metrics.total_tokens(),
            status = ?status,
            "=== MESSAGE DONE ==="
        );
        Ok(narrations.join("\n\n"))
    }

    async fn run_loop(
        &mut self,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        narrations: &mut Vec<String>,
        changed_paths: &mut Vec<String>,
    ) -> Result<LoopExit, AgentError> {
        let max_iterations = self.settings.max_iterations;
        let mut recovered = false;

        for iteration in 1..=max_iterations {
            self.prune(sink);
            self.check_limits(sink)?;

            self.metrics.iterations += 1;
            tracing::info!(
                iteration,
                message_count = self.messages.len(),
                "=== TURN START ==="
            );
            sink.emit(EngineEvent::TurnStarted { iteration });
            sink.emit(EngineEvent::Status {
                status: EngineStatus::Thinking,
            });

            let turn = match self.model_turn(sink, cancel).await {
                Ok(turn) => turn,
                Err(e) if e.is_transient() => {
                    tracing::warn!(iteration, error = %e, "model provider unavailable");
                    return Err(AgentError::from_inference(&e));
                }
                Err(e) if iteration == 1 && !recovered => {
                    tracing::warn!(error = %e, "first model turn failed, injecting recovery note");
                    recovered = true;
                    sink.emit(EngineEvent::Error {
                        message: e.to_string(),
                    });
                    self.messages.push(ConversationMessage::recovery_note(format!(
                        "The previous model request failed: {e}. \
                         Respond again, using the tool markup exactly as described."
                    )));
                    continue;
                }
                Err(e) => {
                    tracing::error!(iteration, error = %e, "model turn failed");
                    return Err(AgentError::from_inference(&e));
                }
            };
            self.record_usage(&turn.raw);

            let narration = turn.narration.trim();
            if !narration.is_empty() {
                narrations.push(narration.to_string());
            }
            if !turn.raw.is_empty() {
                self.messages
                    .push(ConversationMessage::assistant(turn.raw.clone()));
            }
            if turn.aborted {
                tracing::info!(iteration, "model turn aborted");
                return Ok(LoopExit::Aborted);
            }

            if let Some(reason) = detect_stop(&turn.narration) {
                tracing::info!(iteration, reason = reason.as_str(), "stop heuristic matched");
                return Ok(match reason {
                    StopReason::Question => LoopExit::WaitingForUser,
                    StopReason::Completion => LoopExit::Finished,
                });
            }

            let calls = parse_tool_calls(&turn.raw);
            tracing::info!(
                iteration,
                raw_len = turn.raw.len(),
                tool_calls_count = calls.len(),
                "model response received"
            );
            if calls.is_empty() {
                return Ok(LoopExit::Finished);
            }

            sink.emit(EngineEvent::Status {
                status: EngineStatus::RunningTools,
            });
            let report = self.dispatcher.execute(&calls, sink, cancel).await?;

            self.metrics.tools_executed += report.executed_count() as u64;
            for path in &report.changed_paths {
                if !changed_paths.contains(path) {
                    changed_paths.push(path.clone());
                }
            }
            let feedback = report.feedback_message();
            if !feedback.is_empty() {
                self.messages
                    .push(ConversationMessage::tool_feedback(feedback));
            }

            if report.aborted {
                return Ok(LoopExit::Aborted);
            }
            if report.stop_requested {
                tracing::info!(iteration, "tool requested hand-off to the user");
                return Ok(LoopExit::WaitingForUser);
            }
        }

        tracing::warn!(max_iterations, "max iterations reached");
        Ok(LoopExit::MaxIterations)
    }

    /// Prune before a model turn. The model may have changed after a fallback.
    fn prune(&mut self, sink: &dyn EventSink) {
        self.context
            .set_model(self.model.model_name(), self.model.context_window());
        let report = self.context.prune(&mut self.messages);
        if report.pruned() {
            sink.emit(EngineEvent::Pruned {
                removed: report.removed,
                tokens_before: report.tokens_before,
                tokens_after: report.tokens_after,
            });
        }
    }

    /// Fail when a ceiling is met; warn once per threshold on the way up.
    fn check_limits(&mut self, sink: &dyn EventSink) -> Result<(), AgentError> {
        if let Some(max) = self.settings.max_session_tokens {
            let used = self.metrics.total_tokens();
            if used >= max {
                return Err(AgentError::SessionLimitExceeded {
                    reason: format!("{used} of {max} session tokens used"),
                });
            }
            let percent = used as f64 / max as f64 * 100.0;
            if let Some(threshold) = self.warnings.crossed("tokens", percent) {
                tracing::warn!(used, max, threshold, "session token usage warning");
                sink.emit(EngineEvent::Warning {
                    message: format!("Session token usage at {percent:.0}% ({used} of {max})"),
                    threshold,
                });
            }
        }

        if let Some(max) = self.settings.max_session_cost {
            let used = self.metrics.cost_total;
            if used >= max {
                return Err(AgentError::SessionLimitExceeded {
                    reason: format!("session cost {used:.4} reached the limit of {max:.4}"),
                });
            }
            let percent = used / max * 100.0;
            if let Some(threshold) = self.warnings.crossed("cost", percent) {
                tracing::warn!(used, max, threshold, "session cost warning");
                sink.emit(EngineEvent::Warning {
                    message: format!("Session cost at {percent:.0}% ({used:.4} of {max:.4})"),
                    threshold,
                });
            }
        }
        Ok(())
    }

    /// Request one completion, streaming narration to the sink.
    ///
    /// A non-transient failure to start the stream falls back to a single
    /// non-streaming request.
    async fn model_turn(
        &self,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, InferenceError> {
        let request: Vec<ChatMessage> = self
            .messages
            .iter()
            .map(ConversationMessage::to_chat_message)
            .collect();
        let opts = RequestOptions::default();

        let mut filter = TagFilter::new();
        let mut narration = String::new();
        let mut aborted = false;
        let mut show = |visible: String| {
            if !visible.is_empty() {
                narration.push_str(&visible);
                sink.emit(EngineEvent::Chunk { text: visible });
            }
        };

        match self.model.stream(&request, &opts).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        aborted = true;
                        break;
                    }
                    next = stream.next() => match next {
                        Some(Ok(chunk)) => show(filter.feed(&chunk)),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "stream error mid-turn");
                            return Err(e);
                        }
                        None => break,
                    }
                }
            },
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "streaming request failed, retrying without streaming");
                let reply = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    reply = self.model.chat(&request, &opts) => Some(reply?),
                };
                match reply {
                    Some(text) => show(filter.feed(&text)),
                    None => aborted = true,
                }
            }
        }

        show(filter.finish());
        Ok(ModelTurn {
            raw: filter.into_raw(),
            narration,
            aborted,
        })
    }

    /// Add one turn's estimated usage to the session metrics.
    fn record_usage(&mut self, raw: &str) {
        // The request is everything before the assistant message.
        let prompt_tokens = u64::from(self.context.estimate(&self.messages));
        let completion_tokens = u64::from(self.context.estimate_text(raw));
        let cost = self.model.pricing().cost(prompt_tokens, completion_tokens);

        self.metrics.prompt_tokens += prompt_tokens;
        self.metrics.completion_tokens += completion_tokens;
        self.metrics.cost_total += cost;
        tracing::debug!(prompt_tokens, completion_tokens, cost, "turn usage recorded");
    }

    async fn run_related_tests(&self, changed_paths: &[String], sink: &dyn EventSink) {
        if !self.settings.run_related_tests || changed_paths.is_empty() {
            return;
        }
        let Some(runner) = &self.related_tests else {
            return;
        };

        match runner.run_related(changed_paths).await {
            Ok(Some(summary)) => {
                tracing::info!(changed = changed_paths.len(), "related tests ran");
                sink.emit(EngineEvent::TestsRan { summary });
            }
            Ok(None) => tracing::debug!("no related tests for changed files"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "related tests failed to run"),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::tokens::HeuristicEstimator;
    use crate::agent_core::types::MessageKind;
    use crate::test_support::{
        workspace_tools, MemoryWorkspace, RecordingSink, ScriptedConfirmer, ScriptedModel,
        ScriptedReply,
    };
    use std::time::Duration;

    struct Harness {
        engine: Engine,
        model: Arc<ScriptedModel>,
        workspace: Arc<MemoryWorkspace>,
        sink: RecordingSink,
    }

    struct Setup {
        settings: EngineSettings,
        confirmer: Option<Arc<ScriptedConfirmer>>,
        related_tests: Option<Arc<dyn RelatedTests>>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                settings: EngineSettings {
                    require_confirmation: false,
                    ..EngineSettings::default()
                },
                confirmer: None,
                related_tests: None,
            }
        }
    }

    fn harness_with(setup: Setup, replies: Vec<ScriptedReply>) -> Harness {
        let workspace = Arc::new(MemoryWorkspace::with_base(&[(
            "src/main.rs",
            "fn main() {}\n",
        )]));
        let model = Arc::new(ScriptedModel::new(replies));
        let collaborators = Collaborators {
            model: Arc::clone(&model) as Arc<dyn ModelClient>,
            tools: Arc::new(workspace_tools(&workspace)),
            snapshots: Arc::clone(&workspace) as Arc<dyn SnapshotBackend>,
            estimator: Arc::new(HeuristicEstimator),
            confirmer: setup.confirmer.map(|c| c as Arc<dyn Confirmer>),
            related_tests: setup.related_tests,
            working_dir: std::env::temp_dir(),
        };
        Harness {
            engine: Engine::new(setup.settings, collaborators),
            model,
            workspace,
            sink: RecordingSink::default(),
        }
    }

    fn harness(replies: Vec<ScriptedReply>) -> Harness {
        harness_with(Setup::default(), replies)
    }

    fn text(s: &str) -> ScriptedReply {
        ScriptedReply::text(s)
    }

    fn stream_error(reason: &str) -> ScriptedReply {
        ScriptedReply::Fail(InferenceError::StreamError {
            reason: reason.into(),
        })
    }

    fn statuses(sink: &RecordingSink) -> Vec<EngineStatus> {
        sink.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Status { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_health_endpoint_scenario() {
        let confirmer = Arc::new(ScriptedConfirmer::new(&["yes"]));
        let setup = Setup {
            settings: EngineSettings::default(),
            confirmer: Some(Arc::clone(&confirmer)),
            ..Setup::default()
        };
        let mut h = harness_with(
            setup,
            vec![
                text("I'll check the layout first.\n<tool name=\"list_files\" path=\"src\"/>"),
                text(
                    "Adding the endpoint.\n\
                     <tool name=\"write_file\" path=\"src/health.rs\">pub fn health() -> &'static str { \"ok\" }</tool>",
                ),
                text("Done — run the server to test."),
            ],
        );

        let reply = h
            .engine
            .process_message("add a health endpoint", Some(&h.sink))
            .await
            .unwrap();

        assert_eq!(
            reply,
            "I'll check the layout first.\n\nAdding the endpoint.\n\nDone — run the server to test."
        );
        assert_eq!(
            h.workspace.read("src/health.rs").as_deref(),
            Some("pub fn health() -> &'static str { \"ok\" }")
        );
        let prompts = confirmer.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("Allow write_file?"));

        // Each model request after a dispatch ends with the tool feedback.
        let requests = h.model.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1]
            .last()
            .unwrap()
            .content
            .starts_with("Result of list_files:\nsrc/main.rs"));
        assert!(requests[2]
            .last()
            .unwrap()
            .content
            .starts_with("Result of write_file:\nwrote src/health.rs"));

        let metrics = h.engine.metrics();
        assert_eq!(metrics.iterations, 3);
        assert_eq!(metrics.tools_executed, 2);
        assert!(metrics.prompt_tokens > 0 && metrics.completion_tokens > 0);

        // Markup never reaches the visible stream.
        assert!(!h.sink.chunks().contains("<tool"));
        assert_eq!(statuses(&h.sink).last(), Some(&EngineStatus::Idle));
    }

    #[tokio::test]
    async fn test_failed_second_write_rolls_back_batch() {
        let mut h = harness(vec![
            text(
                "Writing both files.\n\
                 <tool name=\"write_file\" path=\"src/a.rs\">pub mod a;</tool>\n\
                 <tool name=\"write_file\" path=\"locked/b.rs\">pub mod b;</tool>",
            ),
            text("The second path is locked, so I left the project as it was."),
        ]);
        let before = h.workspace.files();

        h.engine
            .process_message("split the module", Some(&h.sink))
            .await
            .unwrap();

        assert_eq!(h.workspace.files(), before);
        assert_eq!(h.workspace.snapshot_count(), 0);
        let requests = h.model.requests();
        let feedback = &requests[1].last().unwrap().content;
        assert!(feedback.contains("Result of write_file: FAILED"));
        assert!(feedback.contains("rolled back"));
    }

    #[tokio::test]
    async fn test_question_wins_over_tool_markup() {
        let mut h = harness(vec![text(
            "Should I also add a test?\n<tool name=\"write_file\" path=\"src/t.rs\">x</tool>",
        )]);

        let reply = h
            .engine
            .process_message("add a route", Some(&h.sink))
            .await
            .unwrap();

        assert_eq!(reply, "Should I also add a test?");
        assert!(h.workspace.write_log().is_empty());
        assert_eq!(h.model.requests().len(), 1);
        assert_eq!(h.engine.metrics().tools_executed, 0);
        assert_eq!(statuses(&h.sink).last(), Some(&EngineStatus::WaitingForUser));
        // The response is still recorded, markup included.
        let last = h.engine.messages().last().unwrap();
        assert_eq!(last.kind, MessageKind::Narration);
        assert!(last.content.contains("<tool"));
    }

    #[tokio::test]
    async fn test_completion_announcement_stops_loop() {
        let mut h = harness(vec![text(
            "The app is ready.\n<tool name=\"list_files\" path=\".\"/>",
        )]);

        let reply = h.engine.process_message("build it", None).await.unwrap();

        assert_eq!(reply, "The app is ready.");
        assert_eq!(h.model.requests().len(), 1);
        assert_eq!(h.workspace.read_count("src/main.rs"), 0);
    }

    #[tokio::test]
    async fn test_max_iterations_note() {
        let setup = Setup {
            settings: EngineSettings {
                max_iterations: 2,
                require_confirmation: false,
                ..EngineSettings::default()
            },
            ..Setup::default()
        };
        let mut h = harness_with(
            setup,
            vec![
                text("Looking.\n<tool name=\"read_file\" path=\"src/main.rs\"/>"),
                text("Looking again.\n<tool name=\"list_files\" path=\"src\"/>"),
                text("never requested"),
            ],
        );

        let reply = h.engine.process_message("explore", None).await.unwrap();

        assert!(reply.starts_with("Looking.\n\nLooking again."));
        assert!(reply.contains("maximum of 2 iterations"));
        assert_eq!(h.model.requests().len(), 2);
        // The last batch's results are still in the conversation.
        assert_eq!(
            h.engine.messages().last().unwrap().kind,
            MessageKind::ToolFeedback
        );
    }

    #[tokio::test]
    async fn test_stream_timeout_mid_turn_is_provider_unavailable() {
        let mut h = harness(vec![ScriptedReply::Break(
            "Let me look at".into(),
            InferenceError::Timeout { duration_secs: 180 },
        )]);

        let err = h
            .engine
            .process_message("hello", Some(&h.sink))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ProviderUnavailable { ref kind, .. } if kind == "timeout"));
        assert_eq!(h.model.chat_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_provider_unavailable() {
        let mut h = harness(vec![ScriptedReply::Fail(InferenceError::HttpError {
            status: 429,
            body: "slow down".into(),
        })]);

        let err = h
            .engine
            .process_message("hello", Some(&h.sink))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ProviderUnavailable { ref kind, .. } if kind == "rate limit"));
        assert_eq!(h.model.chat_calls(), 0);
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_stream_failure_falls_back_to_chat() {
        let mut h = harness(vec![stream_error("bad frame"), text("All good.")]);

        let reply = h
            .engine
            .process_message("status?", Some(&h.sink))
            .await
            .unwrap();

        assert_eq!(reply, "All good.");
        assert_eq!(h.model.chat_calls(), 1);
        assert_eq!(h.sink.chunks(), "All good.");
    }

    #[tokio::test]
    async fn test_first_turn_failure_recovers_once() {
        let mut h = harness(vec![
            stream_error("garbled"),
            stream_error("still garbled"),
            text("Here is the summary."),
        ]);

        let reply = h.engine.process_message("summarize", None).await.unwrap();

        assert_eq!(reply, "Here is the summary.");
        let notes: Vec<_> = h
            .engine
            .messages()
            .iter()
            .filter(|m| m.kind == MessageKind::RecoveryNote)
            .collect();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].content.contains("still garbled"));
    }

    #[tokio::test]
    async fn test_later_turn_failure_is_model_error() {
        let mut h = harness(vec![
            text("Reading.\n<tool name=\"read_file\" path=\"src/main.rs\"/>"),
            stream_error("garbled"),
            stream_error("garbled"),
        ]);

        let err = h.engine.process_message("explain", None).await.unwrap_err();

        assert!(matches!(err, AgentError::ModelError { .. }));
    }

    #[tokio::test]
    async fn test_session_token_limit() {
        let setup = Setup {
            settings: EngineSettings {
                max_session_tokens: Some(10),
                require_confirmation: false,
                ..EngineSettings::default()
            },
            ..Setup::default()
        };
        let mut h = harness_with(setup, vec![text("Hello there."), text("unused")]);

        h.engine.process_message("hi", None).await.unwrap();
        let err = h.engine.process_message("again", None).await.unwrap_err();

        assert!(matches!(err, AgentError::SessionLimitExceeded { .. }));
        assert_eq!(h.model.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_usage_warning_fires_once() {
        // Measure one call's usage with no limit, then set a limit it fills to ~92%.
        let mut probe = harness(vec![text("Hello there.")]);
        probe.engine.process_message("hi", None).await.unwrap();
        let used = probe.engine.metrics().total_tokens();
        let limit = (used as f64 / 0.92).ceil() as u64;

        let setup = Setup {
            settings: EngineSettings {
                max_session_tokens: Some(limit),
                require_confirmation: false,
                ..EngineSettings::default()
            },
            ..Setup::default()
        };
        let mut h = harness_with(setup, vec![text("Hello there."), text("Hello again.")]);
        h.engine.process_message("hi", Some(&h.sink)).await.unwrap();
        assert!(!h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Warning { .. })));

        // Checked before the second call's model turn: ~92% used.
        let sink = RecordingSink::default();
        h.engine.process_message("again", Some(&sink)).await.unwrap();
        let warnings: Vec<u8> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Warning { threshold, .. } => Some(threshold),
                _ => None,
            })
            .collect();
        assert_eq!(warnings, vec![90]);
    }

    #[tokio::test]
    async fn test_wait_for_user_tool_stops_loop() {
        let mut h = harness(vec![
            text("I need the port number.\n<tool name=\"wait_for_user\" message=\"port\"/>"),
            text("never requested"),
        ]);

        let reply = h
            .engine
            .process_message("start the server", Some(&h.sink))
            .await
            .unwrap();

        assert_eq!(reply, "I need the port number.");
        assert_eq!(h.model.requests().len(), 1);
        assert!(h.engine.messages().last().unwrap().content.contains("Paused: port"));
        assert_eq!(statuses(&h.sink).last(), Some(&EngineStatus::WaitingForUser));
    }

    #[tokio::test]
    async fn test_abort_returns_partial_narration() {
        let mut h = harness(vec![ScriptedReply::Stall(
            "Let me look at the code".into(),
        )]);
        let handle = h.engine.abort_handle();
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.abort();
        });

        let reply = h
            .engine
            .process_message("explain", Some(&h.sink))
            .await
            .unwrap();
        aborter.await.unwrap();

        assert_eq!(reply, "Let me look at the code");
        assert_eq!(statuses(&h.sink).last(), Some(&EngineStatus::Aborted));
    }

    #[tokio::test]
    async fn test_abort_does_not_leak_into_next_call() {
        let mut h = harness(vec![text("First."), text("Second.")]);
        h.engine.abort();

        assert_eq!(h.engine.process_message("one", None).await.unwrap(), "First.");
        assert_eq!(h.engine.process_message("two", None).await.unwrap(), "Second.");
    }

    #[tokio::test]
    async fn test_pruning_emits_event_and_keeps_system_prompt() {
        let setup = Setup {
            settings: EngineSettings {
                max_messages: 2,
                require_confirmation: false,
                ..EngineSettings::default()
            },
            ..Setup::default()
        };
        let mut h = harness_with(setup, vec![text("One."), text("Two.")]);

        h.engine.process_message("first", None).await.unwrap();
        h.engine
            .process_message("second", Some(&h.sink))
            .await
            .unwrap();

        let pruned = h.sink.events().into_iter().find_map(|e| match e {
            EngineEvent::Pruned { removed, .. } => Some(removed),
            _ => None,
        });
        assert_eq!(pruned, Some(1));
        let messages = h.engine.messages();
        assert!(messages[0].is_system());
        assert_eq!(messages.iter().filter(|m| !m.is_system()).count(), 3);
    }

    #[tokio::test]
    async fn test_initialize_builds_system_prompt() {
        let mut h = harness(vec![text("Hi.")]);
        h.engine.initialize(Some("The project is a web service."));

        assert_eq!(h.engine.messages().len(), 1);
        let prompt = &h.engine.messages()[0].content;
        assert!(prompt.contains("- write_file (modifies files)"));
        assert!(prompt.ends_with("The project is a web service."));

        // process_message keeps an explicit initialization.
        h.engine.process_message("hello", None).await.unwrap();
        assert!(h.engine.messages()[0]
            .content
            .ends_with("The project is a web service."));
    }

    #[tokio::test]
    async fn test_process_message_initializes_implicitly() {
        let mut h = harness(vec![text("Hi.")]);
        h.engine.process_message("hello", None).await.unwrap();

        let requests = h.model.requests();
        let first = &requests[0];
        assert_eq!(first.len(), 2);
        assert!(first[0].content.contains("Available tools:"));
        assert_eq!(first[1].content, "hello");
    }

    #[tokio::test]
    async fn test_session_grant_skips_later_prompts_until_cleared() {
        let confirmer = Arc::new(ScriptedConfirmer::new(&["always", "yes"]));
        let setup = Setup {
            settings: EngineSettings::default(),
            confirmer: Some(Arc::clone(&confirmer)),
            ..Setup::default()
        };
        let write = |path: &str| {
            text(&format!(
                "Writing {path}.\n<tool name=\"write_file\" path=\"{path}\">x</tool>"
            ))
        };
        let mut h = harness_with(
            setup,
            vec![
                write("a.rs"),
                text("Wrote a."),
                write("b.rs"),
                text("Wrote b."),
                write("c.rs"),
                text("Wrote c."),
            ],
        );

        h.engine.process_message("a", None).await.unwrap();
        h.engine.process_message("b", None).await.unwrap();
        assert_eq!(confirmer.prompts().len(), 1);

        h.engine.clear_session_grants();
        h.engine.process_message("c", None).await.unwrap();
        assert_eq!(confirmer.prompts().len(), 2);
        assert_eq!(h.workspace.write_log(), vec!["a.rs", "b.rs", "c.rs"]);
    }

    struct RecordingTests {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelatedTests for RecordingTests {
        async fn run_related(&self, changed: &[String]) -> anyhow::Result<Option<String>> {
            self.seen.lock().unwrap().extend(changed.iter().cloned());
            Ok(Some("1 passed".into()))
        }
    }

    #[tokio::test]
    async fn test_related_tests_run_after_changes() {
        let runner = Arc::new(RecordingTests {
            seen: Mutex::new(Vec::new()),
        });
        let setup = Setup {
            settings: EngineSettings {
                run_related_tests: true,
                require_confirmation: false,
                ..EngineSettings::default()
            },
            related_tests: Some(Arc::clone(&runner) as Arc<dyn RelatedTests>),
            ..Setup::default()
        };
        let mut h = harness_with(
            setup,
            vec![
                text("Writing.\n<tool name=\"write_file\" path=\"src/a.rs\">pub fn a() {}</tool>"),
                text("The function is in place."),
            ],
        );

        let reply = h
            .engine
            .process_message("add a", Some(&h.sink))
            .await
            .unwrap();

        assert_eq!(reply, "Writing.\n\nThe function is in place.");
        assert_eq!(*runner.seen.lock().unwrap(), vec!["src/a.rs".to_string()]);
        assert!(h
            .sink
            .events()
            .contains(&EngineEvent::TestsRan {
                summary: "1 passed".into()
            }));
    }
}
