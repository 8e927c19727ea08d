//! Inference — model client and the tool-call wire protocol.
//!
//! This module handles all communication with the model endpoint:
//! - The `ModelClient` seam the engine depends on
//! - An OpenAI-compatible streaming client with a fallback chain
//! - SSE stream parsing
//! - Tag filtering of tool-call markup out of the visible stream
//! - Parsing `<tool …>` elements into `ToolCall`s
//! - Model configuration loading

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod tag_filter;
pub mod tool_call_parser;
pub mod types;

pub use client::{InferenceClient, ModelClient, TextStream};
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use tag_filter::TagFilter;
pub use tool_call_parser::parse_tool_calls;
pub use types::{ChatMessage, ModelPricing, RequestOptions, Role, ToolCall};
