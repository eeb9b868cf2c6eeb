//! # Stage: Rollback Controller
//!
//! ## Responsibility
//! Restore the tree to a snapshot's captured state: overwrite live files
//! with captured content (creating parent directories as needed), remove
//! files the snapshot recorded as absent, verify every restored file by
//! content hash, then mark the snapshot `rolled_back`.
//!
//! `rollback_to_last_good` targets the most recent snapshot whose batch
//! passed verification. No such snapshot is a fatal, operator-visible
//! condition with zero file changes.
//!
//! ## Guarantees
//! - Idempotent: rolling back to the same snapshot twice leaves the same
//!   tree as rolling back once.
//! - Any restore I/O error or hash mismatch surfaces as `RollbackFailure`,
//!   reported distinctly from ordinary health failures.
//!
//! ## NOT Responsible For
//! - Writing rollback-marker audit entries (orchestrator)
//! - Deciding when to roll back (orchestrator / operator)

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::fsio::ProjectFs;
use crate::policy::PolicyGuard;
use crate::store::{content_hash, PipelineStore};

// ---------------------------------------------------------------------------
// RollbackOutcome
// ---------------------------------------------------------------------------

/// What a completed rollback did to the tree.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub snapshot_id: i64,
    /// Files overwritten with captured content.
    pub files_restored: usize,
    /// Files removed because the snapshot recorded them as absent.
    pub files_removed: usize,
}

// ---------------------------------------------------------------------------
// RollbackController
// ---------------------------------------------------------------------------

/// The restore stage.
pub struct RollbackController {
    guard: PolicyGuard,
    fs: Arc<dyn ProjectFs>,
    store: Arc<PipelineStore>,
}

impl RollbackController {
    pub fn new(guard: PolicyGuard, fs: Arc<dyn ProjectFs>, store: Arc<PipelineStore>) -> Self {
        Self { guard, fs, store }
    }

    /// Restore every captured file of snapshot `id`.
    pub fn rollback_to_snapshot(&self, id: i64) -> Result<RollbackOutcome> {
        // existence check first so a bad id reports as not-found, not as a
        // restore failure
        self.store.snapshot(id)?;
        let files = self.store.snapshot_files(id)?;
        if files.is_empty() {
            return Err(PipelineError::RollbackFailure {
                reason: format!("snapshot {} has no captured files", id),
            });
        }

        let mut restored = 0usize;
        let mut removed = 0usize;
        for file in &files {
            let abs = self.resolve(&file.file_path)?;
            match &file.content {
                Some(content) => {
                    self.fs.write(&abs, content).map_err(|e| PipelineError::RollbackFailure {
                        reason: format!("restoring {}: {}", file.file_path, e),
                    })?;
                    self.verify_restored(&file.file_path, &abs, file.content_hash.as_deref(), content)?;
                    restored += 1;
                }
                None => {
                    if self.fs.exists(&abs) {
                        self.fs.remove(&abs).map_err(|e| PipelineError::RollbackFailure {
                            reason: format!("removing {}: {}", file.file_path, e),
                        })?;
                        removed += 1;
                    }
                }
            }
        }

        self.store.mark_rolled_back(id)?;
        tracing::info!(
            target: "selfpatch::rollback",
            snapshot_id = id,
            files_restored = restored,
            files_removed = removed,
            "Rollback complete"
        );
        Ok(RollbackOutcome { snapshot_id: id, files_restored: restored, files_removed: removed })
    }

    /// Restore the most recent known-good snapshot.
    pub fn rollback_to_last_good(&self) -> Result<RollbackOutcome> {
        match self.store.latest_known_good()? {
            Some(snap) => {
                tracing::warn!(
                    target: "selfpatch::rollback",
                    snapshot_id = snap.id,
                    reason = %snap.reason,
                    "Rolling back to last known-good snapshot"
                );
                self.rollback_to_snapshot(snap.id)
            }
            None => Err(PipelineError::RollbackFailure {
                reason: "no known-good snapshot exists".into(),
            }),
        }
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        self.guard.absolute(rel).map_err(|e| PipelineError::RollbackFailure {
            reason: format!("captured path {} did not resolve: {}", rel, e),
        })
    }

    fn verify_restored(
        &self,
        rel: &str,
        abs: &std::path::Path,
        stored_hash: Option<&str>,
        captured: &[u8],
    ) -> Result<()> {
        let written = self.fs.read(abs).map_err(|e| PipelineError::RollbackFailure {
            reason: format!("re-reading {}: {}", rel, e),
        })?;
        let expected = match stored_hash {
            Some(h) => h.to_string(),
            None => content_hash(captured),
        };
        let actual = content_hash(&written);
        if actual != expected {
            return Err(PipelineError::RollbackFailure {
                reason: format!("hash mismatch after restoring {}", rel),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
