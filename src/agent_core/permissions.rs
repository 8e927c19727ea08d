//! Permission Store — session grants for destructive tools.
//!
//! A destructive call asks the confirmer unless its tool has a session grant.
//! Answering "always" records a grant that lives until the engine is dropped
//! or `clear_session()` is called. Nothing is persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── Types ──────────────────────────────────────────────────────────────────

/// A single permission grant for a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub tool_name: String,
    /// RFC 3339 timestamp when the grant was created.
    pub granted_at: String,
}

/// Result of checking a tool's permission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Tool has an active grant — skip confirmation.
    Allowed,
    /// No grant — proceed with normal confirmation flow.
    NeedsConfirmation,
}

// ─── PermissionStore ────────────────────────────────────────────────────────

/// In-memory session grants.
#[derive(Debug, Default)]
pub struct PermissionStore {
    session_grants: HashMap<String, PermissionGrant>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, tool_name: &str) -> PermissionStatus {
        if self.session_grants.contains_key(tool_name) {
            PermissionStatus::Allowed
        } else {
            PermissionStatus::NeedsConfirmation
        }
    }

    pub fn grant_for_session(&mut self, tool_name: &str) {
        let grant = PermissionGrant {
            tool_name: tool_name.to_string(),
            granted_at: chrono::Utc::now().to_rfc3339(),
        };
        self.session_grants.insert(tool_name.to_string(), grant);
        tracing::info!(tool = tool_name, "permission granted for session");
    }

    /// Revoke a grant. Returns whether one existed.
    pub fn revoke(&mut self, tool_name: &str) -> bool {
        let removed = self.session_grants.remove(tool_name).is_some();
        if removed {
            tracing::info!(tool = tool_name, "permission revoked");
        }
        removed
    }

    pub fn clear_session(&mut self) {
        let count = self.session_grants.len();
        self.session_grants.clear();
        if count > 0 {
            tracing::info!(count, "session permission grants cleared");
        }
    }

    /// All active grants, sorted by tool name.
    pub fn list(&self) -> Vec<&PermissionGrant> {
        let mut grants: Vec<&PermissionGrant> = self.session_grants.values().collect();
        grants.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        grants
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
