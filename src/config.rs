//! Engine configuration loaded from `devloop.yaml`.
//!
//! The file holds the model registry (see [`ModelsConfig`]) at the top level
//! and the engine's loop settings under `engine:`. Every engine setting has a
//! default, so the section may be omitted. `${VAR}` and `${VAR:-default}` are
//! interpolated before parsing.
//!
//! ```yaml
//! active_model: local
//! models:
//!   local:
//!     display_name: Local Qwen
//!     base_url: ${DEVLOOP_MODEL_URL:-http://localhost:8080/v1}
//!     context_window: 32768
//! engine:
//!   max_iterations: 10
//!   max_session_cost: 2.5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::inference::config::interpolate_env_vars;
use crate::inference::{InferenceError, ModelsConfig};

/// Config file name searched for when walking up from the working directory.
pub const CONFIG_FILE_NAME: &str = "devloop.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DEVLOOP_CONFIG";

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a coding assistant working inside the user's project. Use the tools \
to inspect and change files. Keep narration short. When you need something \
from the user, ask and stop. When the task is finished, say so plainly.";

// ─── EngineSettings ─────────────────────────────────────────────────────────

/// Loop, budget, and dispatch settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Model turns per `process_message` call.
    pub max_iterations: u32,
    /// Non-system messages kept by the count cap.
    pub max_messages: usize,
    /// Most recent messages the token policy never prunes.
    pub keep_recent: usize,
    /// Fraction of the context window that triggers token pruning.
    pub prune_target_fraction: f64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub tool_timeout_secs: u64,
    /// Hard ceiling on prompt + completion tokens for the engine's lifetime.
    pub max_session_tokens: Option<u64>,
    /// Hard ceiling on accumulated cost.
    pub max_session_cost: Option<f64>,
    /// Ask before running destructive tools.
    pub require_confirmation: bool,
    /// Run related tests after source files change.
    pub run_related_tests: bool,
    pub system_prompt: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_messages: 40,
            keep_recent: 2,
            prune_target_fraction: 0.7,
            cache_ttl_secs: 120,
            cache_capacity: 50,
            tool_timeout_secs: 120,
            max_session_tokens: None,
            max_session_cost: None,
            require_confirmation: true,
            run_related_tests: false,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl EngineSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

// ─── EngineConfig ───────────────────────────────────────────────────────────

/// The whole `devloop.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Find the config file.
///
/// Search order:
/// 1. `DEVLOOP_CONFIG` environment variable
/// 2. Walk upward from `start` looking for `devloop.yaml`
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(&explicit);
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %explicit, "{CONFIG_ENV_VAR} points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!(
            "could not find {CONFIG_FILE_NAME}. Set {CONFIG_ENV_VAR} or run from inside the project."
        ),
    })
}

/// Load and parse a config file, interpolating environment variables.
pub fn load_config(path: &Path) -> Result<EngineConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = parse_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        active_model = %config.models.active_model,
        max_iterations = config.engine.max_iterations,
        "config loaded"
    );
    Ok(config)
}

/// Parse config text, interpolating environment variables first.
pub fn parse_config(raw: &str) -> Result<EngineConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);
    let config: EngineConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    validate(&config.engine)?;
    Ok(config)
}

fn validate(settings: &EngineSettings) -> Result<(), InferenceError> {
    if settings.max_iterations == 0 {
        return Err(InferenceError::ConfigError {
            reason: "engine.max_iterations must be at least 1".into(),
        });
    }
    if !(0.0..=1.0).contains(&settings.prune_target_fraction) || settings.prune_target_fraction == 0.0 {
        return Err(InferenceError::ConfigError {
            reason: format!(
                "engine.prune_target_fraction must be in (0, 1], got {}",
                settings.prune_target_fraction
            ),
        });
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
