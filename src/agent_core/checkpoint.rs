//! Checkpoint Store — working-tree transactions around destructive batches.
//!
//! The dispatcher opens one checkpoint before the first call of a sequential
//! batch that contains a destructive tool, then either commits it (discard
//! the snapshot) or rolls it back (restore, then discard). At most one
//! checkpoint is open at a time; the caller enforces that.
//!
//! Snapshots come from a [`SnapshotBackend`]. A checkpoint taken over a clean
//! tree stores no snapshot, and rolling it back reverts the tree to the base
//! revision. Every operation goes through one async mutex, so checkpoint,
//! commit, and rollback never run concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::errors::CheckpointError;

// ─── Snapshot Backend ───────────────────────────────────────────────────────

/// Handle to a stored snapshot. Backends locate it by label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub label: String,
}

/// One stored snapshot as reported by [`SnapshotBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Backend-specific reference (e.g. `stash@{0}`).
    pub reference: String,
    pub label: String,
}

/// Version-control snapshot collaborator.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// The tree differs from the base revision.
    async fn has_changes(&self) -> Result<bool, CheckpointError>;

    /// Save the current dirty state under `label`. The tree is left as it was.
    async fn snapshot(&self, label: &str) -> Result<SnapshotId, CheckpointError>;

    async fn list(&self) -> Result<Vec<SnapshotEntry>, CheckpointError>;

    /// Re-apply a snapshot on top of a tree that is at the base revision.
    async fn restore(&self, id: &SnapshotId) -> Result<(), CheckpointError>;

    async fn discard(&self, id: &SnapshotId) -> Result<(), CheckpointError>;

    /// Throw away every change since the base revision, untracked files included.
    async fn revert_to_base(&self) -> Result<(), CheckpointError>;
}

// ─── Checkpoint ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
    /// `None` when the tree was clean at checkpoint time.
    pub snapshot: Option<SnapshotId>,
}

/// How an open checkpoint was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Commit,
    Rollback,
}

pub struct CheckpointStore {
    backend: Arc<dyn SnapshotBackend>,
    open: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn SnapshotBackend>) -> Self {
        Self {
            backend,
            open: Mutex::new(None),
        }
    }

    /// Open a checkpoint. Snapshots the tree only if it has pending changes.
    pub async fn checkpoint(&self, label: &str) -> Result<(), CheckpointError> {
        let mut open = self.open.lock().await;

        if let Some(stale) = open.take() {
            tracing::warn!(label = %stale.label, "checkpoint still open, committing it first");
            self.resolve(stale, Resolution::Commit).await?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let full_label = format!("devloop-checkpoint {label} {id}");

        let snapshot = if self.backend.has_changes().await? {
            Some(self.backend.snapshot(&full_label).await?)
        } else {
            None
        };

        tracing::info!(
            checkpoint_id = %id,
            label,
            dirty = snapshot.is_some(),
            "checkpoint opened"
        );

        *open = Some(Checkpoint {
            id,
            label: full_label,
            created_at: Utc::now(),
            consumed: false,
            snapshot,
        });
        Ok(())
    }

    /// Keep the current tree and discard the snapshot.
    pub async fn commit(&self) -> Result<(), CheckpointError> {
        let mut open = self.open.lock().await;
        match open.take() {
            Some(checkpoint) => self.resolve(checkpoint, Resolution::Commit).await,
            None => {
                tracing::debug!("commit with no open checkpoint");
                Ok(())
            }
        }
    }

    /// Restore the pre-checkpoint tree. Returns `false` if nothing was open.
    pub async fn rollback(&self) -> Result<bool, CheckpointError> {
        let mut open = self.open.lock().await;
        match open.take() {
            Some(checkpoint) => {
                self.resolve(checkpoint, Resolution::Rollback).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn has_open(&self) -> bool {
        self.open.lock().await.is_some()
    }

    /// The open checkpoint, if any.
    pub async fn current(&self) -> Option<Checkpoint> {
        self.open.lock().await.clone()
    }

    /// Consume a checkpoint. Must be called with the `open` lock held.
    async fn resolve(
        &self,
        mut checkpoint: Checkpoint,
        resolution: Resolution,
    ) -> Result<(), CheckpointError> {
        checkpoint.consumed = true;

        if resolution == Resolution::Rollback {
            let rollback_failed = |e: CheckpointError| CheckpointError::RollbackFailed {
                label: checkpoint.label.clone(),
                reason: e.to_string(),
            };

            // Confirm the snapshot exists before touching the tree; reverting
            // without it would lose the pre-checkpoint changes.
            if let Some(snapshot) = &checkpoint.snapshot {
                let listed = self.backend.list().await.map_err(rollback_failed)?;
                if !listed.iter().any(|e| e.label == snapshot.label) {
                    tracing::error!(label = %snapshot.label, "snapshot missing, tree left as is");
                    return Err(CheckpointError::SnapshotMissing {
                        label: snapshot.label.clone(),
                    });
                }
            }

            self.backend.revert_to_base().await.map_err(rollback_failed)?;

            if let Some(snapshot) = &checkpoint.snapshot {
                self.backend.restore(snapshot).await.map_err(rollback_failed)?;
            }
        }

        if let Some(snapshot) = &checkpoint.snapshot {
            self.backend.discard(snapshot).await?;
        }

        tracing::info!(
            checkpoint_id = %checkpoint.id,
            resolution = ?resolution,
            age_ms = (Utc::now() - checkpoint.created_at).num_milliseconds(),
            "checkpoint resolved"
        );
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
