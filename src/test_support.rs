//! Shared fakes for unit tests: a scripted model, an in-memory workspace with
//! stash-style snapshots, file tools over that workspace, a recording event
//! sink, and a scripted confirmer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::agent_core::checkpoint::{SnapshotBackend, SnapshotEntry, SnapshotId};
use crate::agent_core::errors::CheckpointError;
use crate::agent_core::events::{EngineEvent, EventSink};
use crate::inference::types::{ChatMessage, RequestOptions, ToolCall};
use crate::inference::{InferenceError, ModelClient, TextStream};
use crate::tools::{
    required_param, Confirmer, OutputKind, ToolCategory, ToolContext, ToolHandler, ToolOutput,
    ToolRegistry, ToolSpec,
};

// ─── Scripted Model ─────────────────────────────────────────────────────────

/// Size of the chunks a scripted reply is streamed in.
const CHUNK_CHARS: usize = 7;

pub enum ScriptedReply {
    /// Streamed in small chunks.
    Text(String),
    /// The request fails before any text arrives.
    Fail(InferenceError),
    /// Streams the text, then never finishes.
    Stall(String),
    /// Streams the text, then the body read fails.
    Break(String, InferenceError),
}

impl ScriptedReply {
    pub fn text(s: impl Into<String>) -> Self {
        ScriptedReply::Text(s.into())
    }
}

/// A model that replays a fixed list of replies and records every request.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    chat_calls: Mutex<usize>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            chat_calls: Mutex::new(0),
        }
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn chat_calls(&self) -> usize {
        *self.chat_calls.lock().unwrap()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> ScriptedReply {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Fail(InferenceError::StreamError {
                reason: "script exhausted".into(),
            }))
    }
}

fn chunked(text: &str) -> Vec<Result<String, InferenceError>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| Ok(c.iter().collect()))
        .collect()
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_name(&self) -> String {
        "scripted".to_string()
    }

    fn context_window(&self) -> u32 {
        32_768
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _opts: &RequestOptions,
    ) -> Result<TextStream, InferenceError> {
        match self.next_reply(messages) {
            ScriptedReply::Text(text) => Ok(stream::iter(chunked(&text)).boxed()),
            ScriptedReply::Stall(text) => Ok(stream::iter(chunked(&text))
                .chain(stream::pending())
                .boxed()),
            ScriptedReply::Break(text, e) => Ok(stream::iter(chunked(&text))
                .chain(stream::once(async move { Err(e) }))
                .boxed()),
            ScriptedReply::Fail(e) => Err(e),
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _opts: &RequestOptions,
    ) -> Result<String, InferenceError> {
        *self.chat_calls.lock().unwrap() += 1;
        match self.next_reply(messages) {
            ScriptedReply::Text(text) | ScriptedReply::Stall(text) => Ok(text),
            ScriptedReply::Fail(e) | ScriptedReply::Break(_, e) => Err(e),
        }
    }
}

// ─── Memory Workspace ───────────────────────────────────────────────────────

#[derive(Default)]
struct WorkspaceState {
    base: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    /// Newest first, like `git stash list`.
    stashes: VecDeque<(String, BTreeMap<String, String>)>,
    write_log: Vec<String>,
    reads: HashMap<String, usize>,
    change_checks: usize,
    fail_revert: bool,
}

/// An in-memory working tree with a base revision and stash-like snapshots.
#[derive(Default)]
pub struct MemoryWorkspace {
    state: Mutex<WorkspaceState>,
}

impl MemoryWorkspace {
    pub fn with_base(files: &[(&str, &str)]) -> Self {
        let base: BTreeMap<String, String> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        Self {
            state: Mutex::new(WorkspaceState {
                files: base.clone(),
                base,
                ..Default::default()
            }),
        }
    }

    /// Direct edit, as if the user changed the file.
    pub fn write(&self, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
    }

    pub fn remove(&self, path: &str) {
        self.state.lock().unwrap().files.remove(path);
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().files.clone()
    }

    /// Paths written through the fake tools, in order.
    pub fn write_log(&self) -> Vec<String> {
        self.state.lock().unwrap().write_log.clone()
    }

    /// Times a path was read through the fake tools.
    pub fn read_count(&self, path: &str) -> usize {
        self.state.lock().unwrap().reads.get(path).copied().unwrap_or(0)
    }

    /// Checkpoints opened against this workspace (one change check each).
    pub fn checkpoint_count(&self) -> usize {
        self.state.lock().unwrap().change_checks
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().stashes.len()
    }

    pub fn drop_all_snapshots(&self) {
        self.state.lock().unwrap().stashes.clear();
    }

    pub fn fail_revert(&self, fail: bool) {
        self.state.lock().unwrap().fail_revert = fail;
    }

    fn tool_read(&self, path: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        *state.reads.entry(path.to_string()).or_default() += 1;
        state.files.get(path).cloned()
    }

    fn tool_write(&self, path: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), content.to_string());
        state.write_log.push(path.to_string());
    }

    fn tool_delete(&self, path: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let removed = state.files.remove(path).is_some();
        if removed {
            state.write_log.push(path.to_string());
        }
        removed
    }
}

#[async_trait]
impl SnapshotBackend for MemoryWorkspace {
    async fn has_changes(&self) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock().unwrap();
        state.change_checks += 1;
        Ok(state.files != state.base)
    }

    async fn snapshot(&self, label: &str) -> Result<SnapshotId, CheckpointError> {
        let mut state = self.state.lock().unwrap();
        let files = state.files.clone();
        state.stashes.push_front((label.to_string(), files));
        Ok(SnapshotId {
            label: label.to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<SnapshotEntry>, CheckpointError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .stashes
            .iter()
            .enumerate()
            .map(|(i, (label, _))| SnapshotEntry {
                reference: format!("stash@{{{i}}}"),
                label: label.clone(),
            })
            .collect())
    }

    async fn restore(&self, id: &SnapshotId) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().unwrap();
        let files = state
            .stashes
            .iter()
            .find(|(label, _)| *label == id.label)
            .map(|(_, files)| files.clone())
            .ok_or_else(|| CheckpointError::SnapshotMissing {
                label: id.label.clone(),
            })?;
        state.files = files;
        Ok(())
    }

    async fn discard(&self, id: &SnapshotId) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().unwrap();
        let before = state.stashes.len();
        state.stashes.retain(|(label, _)| *label != id.label);
        if state.stashes.len() == before {
            return Err(CheckpointError::SnapshotMissing {
                label: id.label.clone(),
            });
        }
        Ok(())
    }

    async fn revert_to_base(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_revert {
            return Err(CheckpointError::Backend {
                operation: "revert".into(),
                reason: "index.lock exists".into(),
            });
        }
        state.files = state.base.clone();
        Ok(())
    }
}

// ─── Fake Tools ─────────────────────────────────────────────────────────────

struct ListFiles(Arc<MemoryWorkspace>);

#[async_trait]
impl ToolHandler for ListFiles {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("list_files", ToolCategory::ReadOnly)
            .describe("List files under `path`.")
            .output(OutputKind::Listing)
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let prefix = call.param("path").unwrap_or(".").trim_start_matches("./");
        let listing: Vec<String> = self
            .0
            .files()
            .into_keys()
            .filter(|p| prefix == "." || prefix.is_empty() || p.starts_with(prefix))
            .collect();
        Ok(ToolOutput::Success(listing.join("\n")))
    }
}

struct ReadFile(Arc<MemoryWorkspace>);

#[async_trait]
impl ToolHandler for ReadFile {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("read_file", ToolCategory::ReadOnly)
            .describe("Read the file at `path`.")
            .output(OutputKind::FileContent)
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = required_param(call, "path")?;
        if path == "panic!" {
            panic!("read_file blew up");
        }
        Ok(match self.0.tool_read(path) {
            Some(content) => ToolOutput::Success(content),
            None => ToolOutput::Error(format!("no such file: {path}")),
        })
    }
}

struct WriteFile(Arc<MemoryWorkspace>);

#[async_trait]
impl ToolHandler for WriteFile {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("write_file", ToolCategory::Destructive)
            .describe("Write the inline content to `path`.")
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = required_param(call, "path")?;
        if path.starts_with("locked/") {
            return Ok(ToolOutput::Error(format!("permission denied: {path} is locked")));
        }
        let content = call.inline_content.as_deref().unwrap_or_default();
        self.0.tool_write(path, content);
        Ok(ToolOutput::Success(format!("wrote {path}")))
    }
}

struct DeleteFile(Arc<MemoryWorkspace>);

#[async_trait]
impl ToolHandler for DeleteFile {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("delete_file", ToolCategory::Destructive).describe("Delete `path`.")
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = required_param(call, "path")?;
        if self.0.tool_delete(path) {
            Ok(ToolOutput::Success(format!("deleted {path}")))
        } else {
            anyhow::bail!("cannot delete {path}: not found")
        }
    }
}

/// A destructive tool with no path argument. Understands `touch <path>` and
/// `sleep <ms>` steps joined by `&&`.
pub struct RunCommand(pub Arc<MemoryWorkspace>);

#[async_trait]
impl ToolHandler for RunCommand {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("run_command", ToolCategory::Destructive).describe("Run `command`.")
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let command = required_param(call, "command")?;
        for step in command.split("&&").map(str::trim) {
            match step.split_once(' ') {
                Some(("touch", path)) => self.0.tool_write(path.trim(), ""),
                Some(("sleep", ms)) => {
                    tokio::time::sleep(Duration::from_millis(ms.trim().parse()?)).await
                }
                _ => anyhow::bail!("unsupported command: {step}"),
            }
        }
        Ok(ToolOutput::Success(format!("ran {command}")))
    }
}

/// A read-only tool that takes a fixed time to answer.
pub struct SlowTool {
    name: &'static str,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self { name, delay }
    }
}

#[async_trait]
impl ToolHandler for SlowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(self.name, ToolCategory::ReadOnly)
    }

    async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        tokio::time::sleep(self.delay).await;
        Ok(ToolOutput::Success(format!("{} finished", self.name)))
    }
}

/// Registry with `list_files`, `read_file`, `write_file`, and `delete_file`
/// over `workspace`, plus the builtin `wait_for_user`.
pub fn workspace_tools(workspace: &Arc<MemoryWorkspace>) -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(ListFiles(Arc::clone(workspace))))
        .with(Arc::new(ReadFile(Arc::clone(workspace))))
        .with(Arc::new(WriteFile(Arc::clone(workspace))))
        .with(Arc::new(DeleteFile(Arc::clone(workspace))))
}

// ─── Events & Confirmation ──────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn chunks(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Chunk { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Answers prompts from a fixed list, then with the default.
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn prompt(&self, message: &str, _choices: &[&str], default: &str) -> String {
        self.prompts.lock().unwrap().push(message.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| default.to_string())
    }
}
