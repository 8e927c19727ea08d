//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that end a `process_message` call.
///
/// Tool failures never appear here; they are fed back to the model as text.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A configured session ceiling was reached before the model call.
    #[error("session limit exceeded: {reason}")]
    SessionLimitExceeded { reason: String },

    /// Timeout, rate limit, quota, auth, or connectivity failure at the provider.
    #[error("model provider unavailable ({kind}): {reason}. Please retry in a moment.")]
    ProviderUnavailable { kind: String, reason: String },

    /// A non-transient model failure that recovery could not absorb.
    #[error("model error: {reason}")]
    ModelError { reason: String },

    /// Checkpoint open, commit, or rollback failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl AgentError {
    /// Classify a provider failure into the transient or model variant.
    pub(crate) fn from_inference(e: &InferenceError) -> Self {
        if e.is_transient() {
            AgentError::ProviderUnavailable {
                kind: e.transient_kind().to_string(),
                reason: e.to_string(),
            }
        } else {
            AgentError::ModelError {
                reason: e.to_string(),
            }
        }
    }
}

/// Errors from the checkpoint store or its snapshot backend.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The version-control backend failed.
    #[error("snapshot backend failed during {operation}: {reason}")]
    Backend { operation: String, reason: String },

    /// A snapshot recorded at checkpoint time can no longer be found.
    #[error("snapshot '{label}' not found")]
    SnapshotMissing { label: String },

    /// Restoring the pre-checkpoint state failed; the tree may be inconsistent.
    #[error("rollback of '{label}' failed: {reason}")]
    RollbackFailed { label: String, reason: String },
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Backend {
            operation: "io".to_string(),
            reason: e.to_string(),
        }
    }
}
