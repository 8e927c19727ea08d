//! Git-backed [`SnapshotBackend`] built on `git stash`.
//!
//! A snapshot is a stash entry whose message is the checkpoint label. Taking
//! one stashes the dirty tree (untracked files included) and immediately
//! re-applies it, so the working tree is unchanged afterwards. Stash indices
//! shift as entries come and go, so entries are always located by label.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use super::checkpoint::{SnapshotBackend, SnapshotEntry, SnapshotId};
use super::errors::CheckpointError;

#[derive(Debug, Clone)]
pub struct GitSnapshots {
    repo_dir: PathBuf,
}

impl GitSnapshots {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Run git in the repo and return stdout. Non-zero exit is an error.
    async fn git(&self, operation: &str, args: &[&str]) -> Result<String, CheckpointError> {
        let output = Command::new("git")
            // Stash needs an identity even when the user has none configured.
            .args(["-c", "user.name=devloop", "-c", "user.email=devloop@localhost"])
            .args(args)
            .current_dir(&self.repo_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CheckpointError::Backend {
                operation: operation.to_string(),
                reason: format!("failed to run git: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(operation, status = ?output.status.code(), stderr = %stderr.trim(), "git failed");
            return Err(CheckpointError::Backend {
                operation: operation.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn reference_for(&self, id: &SnapshotId) -> Result<String, CheckpointError> {
        self.list()
            .await?
            .into_iter()
            .find(|entry| entry.label == id.label)
            .map(|entry| entry.reference)
            .ok_or_else(|| CheckpointError::SnapshotMissing {
                label: id.label.clone(),
            })
    }
}

#[async_trait]
impl SnapshotBackend for GitSnapshots {
    async fn has_changes(&self) -> Result<bool, CheckpointError> {
        let status = self.git("status", &["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    async fn snapshot(&self, label: &str) -> Result<SnapshotId, CheckpointError> {
        self.git(
            "snapshot",
            &["stash", "push", "--include-untracked", "-m", label],
        )
        .await?;
        let id = SnapshotId {
            label: label.to_string(),
        };
        let reference = self.reference_for(&id).await?;
        self.git("snapshot", &["stash", "apply", "--index", &reference])
            .await?;
        tracing::debug!(label, reference = %reference, "git snapshot stored");
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<SnapshotEntry>, CheckpointError> {
        let output = self
            .git("list", &["stash", "list", "--format=%gd%x00%gs"])
            .await?;
        Ok(parse_stash_list(&output))
    }

    async fn restore(&self, id: &SnapshotId) -> Result<(), CheckpointError> {
        let reference = self.reference_for(id).await?;
        self.git("restore", &["stash", "apply", "--index", &reference])
            .await?;
        Ok(())
    }

    async fn discard(&self, id: &SnapshotId) -> Result<(), CheckpointError> {
        let reference = self.reference_for(id).await?;
        self.git("discard", &["stash", "drop", &reference]).await?;
        Ok(())
    }

    async fn revert_to_base(&self) -> Result<(), CheckpointError> {
        self.git("revert", &["reset", "--hard", "HEAD"]).await?;
        self.git("revert", &["clean", "-fd"]).await?;
        Ok(())
    }
}

/// Parse `git stash list --format=%gd%x00%gs` output.
///
/// The subject of a `stash push -m <label>` entry is `On <branch>: <label>`.
fn parse_stash_list(output: &str) -> Vec<SnapshotEntry> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (reference, subject) = line.split_once('\0')?;
            let label = subject
                .split_once(": ")
                .map(|(_, label)| label)
                .unwrap_or(subject);
            Some(SnapshotEntry {
                reference: reference.to_string(),
                label: label.to_string(),
            })
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
