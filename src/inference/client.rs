//! Model client seam and the OpenAI-compatible implementation.
//!
//! The engine talks to the model only through [`ModelClient`]. The shipped
//! [`InferenceClient`] sends chat completion requests to an OpenAI-compatible
//! endpoint, streams back text, and walks the configured fallback chain when
//! the current model is unreachable.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client as HttpClient;

use super::config::{resolve_active_model, ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ChatMessage, ModelPricing, RequestOptions};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total request timeout for streaming calls.
///
/// Large contexts take a while before the first token arrives; a short
/// timeout silently truncates the stream.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── ModelClient ─────────────────────────────────────────────────────────────

/// A boxed stream of text chunks from one model turn.
///
/// Dropping the stream cancels the underlying request.
pub type TextStream = BoxStream<'static, Result<String, InferenceError>>;

/// The model collaborator the engine depends on.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier passed to the token estimator.
    fn model_name(&self) -> String;

    /// Context window of the current model, in tokens.
    fn context_window(&self) -> u32;

    /// Pricing used for session cost accounting.
    fn pricing(&self) -> ModelPricing {
        ModelPricing::default()
    }

    /// Start a streamed completion over `messages`.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<TextStream, InferenceError>;

    /// Non-streaming completion, used when streaming cannot be started.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<String, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// The model currently selected from the fallback chain.
#[derive(Debug, Clone)]
struct ActiveModel {
    key: String,
    config: ModelConfig,
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct InferenceClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests (longer timeout).
    http_stream: HttpClient,
    /// The full models configuration (for the fallback chain).
    config: ModelsConfig,
    /// Current model plus the keys that already failed.
    state: Mutex<(ActiveModel, Vec<String>)>,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Resolves the active model from config. Does NOT check connectivity —
    /// that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let (key, model) = resolve_active_model(&config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            config,
            state: Mutex::new((ActiveModel { key, config: model }, Vec::new())),
        })
    }

    fn active(&self) -> ActiveModel {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.0.clone()
    }

    /// Key of the currently selected model.
    pub fn current_model_key(&self) -> String {
        self.active().key
    }

    // ─── Fallback Chain ──────────────────────────────────────────────────

    /// Move to the next model in the fallback chain.
    ///
    /// Returns `Err` if no more fallbacks are available.
    pub fn try_next_fallback(&self) -> Result<(), InferenceError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (ref mut active, ref mut exhausted) = *guard;
        exhausted.push(active.key.clone());

        for key in &self.config.fallback_chain {
            if exhausted.contains(key) {
                continue;
            }
            if let Some(model) = self.config.models.get(key) {
                tracing::warn!(from = %active.key, to = %key, "switching to fallback model");
                *active = ActiveModel {
                    key: key.clone(),
                    config: model.clone(),
                };
                return Ok(());
            }
        }

        Err(InferenceError::AllModelsUnavailable {
            attempted: exhausted.clone(),
        })
    }

    /// Number of fallback models not yet tried (the current one excluded).
    fn remaining_fallbacks(&self) -> usize {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (ref active, ref exhausted) = *guard;
        self.config
            .fallback_chain
            .iter()
            .filter(|k| !exhausted.contains(k) && **k != active.key)
            .filter(|k| self.config.models.contains_key(k.as_str()))
            .count()
    }

    /// Whether an error should trigger a fallback attempt.
    ///
    /// HTTP 404 is included because local servers return it when a model is
    /// not installed; the next model in the chain may still be available.
    fn is_retriable(err: &InferenceError) -> bool {
        matches!(
            err,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 404, .. }
                | InferenceError::HttpError { status: 429, .. }
                | InferenceError::HttpError { status: 500, .. }
                | InferenceError::HttpError {
                    status: 502..=504,
                    ..
                }
        )
    }

    fn build_request(
        model: &ActiveModel,
        messages: &[ChatMessage],
        opts: &RequestOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model
                .config
                .model_name
                .clone()
                .unwrap_or_else(|| model.key.clone()),
            messages: messages.to_vec(),
            temperature: opts.temperature.unwrap_or(model.config.temperature),
            max_tokens: opts.max_tokens.unwrap_or(model.config.max_tokens),
            stream,
        }
    }

    fn authorize(
        request: reqwest::RequestBuilder,
        model: &ActiveModel,
    ) -> reqwest::RequestBuilder {
        match model
            .config
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
        {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_send_error(e: reqwest::Error, url: &str, timeout: Duration) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout.as_secs(),
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// Classify an error raised while reading a response body. Timeouts and
    /// dropped connections stay transient so the engine can report the
    /// provider as unavailable.
    fn map_body_error(e: reqwest::Error, url: &str, timeout: Duration) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout.as_secs(),
            }
        } else if e.is_connect() {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        } else {
            InferenceError::StreamError {
                reason: format!("stream read error: {e}"),
            }
        }
    }

    /// Attempt a single streaming request to the given model.
    async fn try_stream_request(
        &self,
        model: &ActiveModel,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<TextStream, InferenceError> {
        let url = format!("{}/chat/completions", model.config.base_url);
        let body = Self::build_request(model, messages, opts, true);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let request = self
            .http_stream
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream");

        let response = Self::authorize(request, model)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, &url, STREAM_REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body = response
            .bytes_stream()
            .map_err(move |e| Self::map_body_error(e, &url, STREAM_REQUEST_TIMEOUT));
        Ok(parse_sse_stream(body).boxed())
    }

    async fn try_chat_request(
        &self,
        model: &ActiveModel,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", model.config.base_url);
        let body = Self::build_request(model, messages, opts, false);

        let response = Self::authorize(self.http.post(&url).json(&body), model)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, &url, REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| Self::map_body_error(e, &url, REQUEST_TIMEOUT))?;

        parse_non_streaming_response(&body_text)
    }
}

#[async_trait]
impl ModelClient for InferenceClient {
    fn model_name(&self) -> String {
        let active = self.active();
        active.config.model_name.unwrap_or(active.key)
    }

    fn context_window(&self) -> u32 {
        self.active().config.context_window
    }

    fn pricing(&self) -> ModelPricing {
        self.active().config.pricing()
    }

    /// Send a streaming chat completion request.
    ///
    /// If the current model is unavailable, tries the fallback chain before
    /// returning an error.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<TextStream, InferenceError> {
        let mut last_error: Option<InferenceError> = None;

        for _attempt in 0..=self.remaining_fallbacks() {
            let model = self.active();
            match self.try_stream_request(&model, messages, opts).await {
                Ok(stream) => return Ok(stream),
                Err(e) if Self::is_retriable(&e) => {
                    tracing::warn!(model = %model.key, error = %e, "model request failed");
                    last_error = Some(e);
                    if self.try_next_fallback().is_err() {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(InferenceError::AllModelsUnavailable {
            attempted: vec![self.current_model_key()],
        }))
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<String, InferenceError> {
        let mut last_error: Option<InferenceError> = None;

        for _attempt in 0..=self.remaining_fallbacks() {
            let model = self.active();
            match self.try_chat_request(&model, messages, opts).await {
                Ok(text) => return Ok(text),
                Err(e) if Self::is_retriable(&e) => {
                    last_error = Some(e);
                    if self.try_next_fallback().is_err() {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(InferenceError::AllModelsUnavailable {
            attempted: vec![self.current_model_key()],
        }))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
