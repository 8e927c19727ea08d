//! Shared types for the inference client.
//!
//! Request/response shapes mirror the OpenAI Chat Completions API. `ToolCall`
//! is the engine-side representation of one parsed `<tool …>` element.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Request Types ───────────────────────────────────────────────────────────

/// A single message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Optional per-call overrides for the model config defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Override temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: Option<f32>,
    /// Override the completion token cap.
    pub max_tokens: Option<u32>,
}

/// Per-model pricing, in currency units per 1,000 tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl ModelPricing {
    /// Cost of a single model turn.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_per_1k
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// Parameter names whose values are workspace paths.
pub const PATH_PARAMS: &[&str] = &[
    "path",
    "file",
    "dir",
    "directory",
    "source",
    "destination",
    "target",
];

/// A tool call parsed from the model's response markup.
///
/// Parameters are flat strings; coercion to numbers or booleans is the
/// tool's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Generated ID used to correlate tool events.
    pub id: String,
    /// Tool name from the `name` attribute.
    pub name: String,
    /// All other attributes, in key order.
    pub parameters: BTreeMap<String, String>,
    /// Raw text between the opening and closing tags (content form only).
    pub inline_content: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            parameters: BTreeMap::new(),
            inline_content: None,
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Builder-style inline content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.inline_content = Some(content.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// The `path` parameter, which most file tools use.
    pub fn path(&self) -> Option<&str> {
        self.param("path")
    }

    /// Every path-like argument of the call, in parameter order.
    pub fn paths(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|(key, value)| PATH_PARAMS.contains(&key.as_str()) && !value.is_empty())
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Stable serialization of the arguments, used as the cache key.
    pub fn serialized_parameters(&self) -> String {
        let mut out = serde_json::to_string(&self.parameters).unwrap_or_default();
        if let Some(ref content) = self.inline_content {
            out.push('\u{1f}');
            out.push_str(content);
        }
        out
    }
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// Raw SSE chunk from the OpenAI API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
///
/// Only `content` is surfaced; reasoning channels some servers emit are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
