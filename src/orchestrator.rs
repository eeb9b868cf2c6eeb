//! # Stage: Orchestrator
//!
//! ## Responsibility
//! Drive one mutation batch through the full sequence:
//! Validate -> Snapshot -> Apply -> Verify -> (Commit | Rollback).
//! Exactly one snapshot per run, captured strictly before any write. The
//! health verifier is the sole gate between "files were written" and "the
//! batch is accepted"; on a failed gate the run rolls back automatically.
//!
//! ## Guarantees
//! - Runs are serialized: a single execution lock is held across the whole
//!   sequence, so two runs can never interleave their phases.
//! - A snapshot-creation failure terminates the run before any write.
//! - Every terminal state is durably logged, including synthetic per-file
//!   markers when an automatic rollback occurs.
//! - A cooperative cancellation token is checked between phases and between
//!   files, never mid-write. A run cancelled after writes began still
//!   verifies, still rolls back if unhealthy, and never marks its snapshot
//!   known-good.
//!
//! ## NOT Responsible For
//! - Privilege checks and request plumbing (service layer)
//! - Background execution and result retention (job tracker)

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::applier::{FileOutcome, MutationApplier};
use crate::batch::ModificationRequest;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fsio::ProjectFs;
use crate::health::{ExternalCheck, HealthCheckOptions, HealthReport, HealthVerifier};
use crate::policy::PolicyGuard;
use crate::rollback::RollbackController;
use crate::store::{capture_files, NewLogEntry, PipelineStore};
use crate::validator::{PreflightValidator, ValidationReport};

// ---------------------------------------------------------------------------
// RunDisposition / RunOutcome
// ---------------------------------------------------------------------------

/// Terminal state of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDisposition {
    /// Validation failed. Nothing was written.
    Rejected,
    /// Snapshot creation failed. Nothing was written.
    SnapshotFailed,
    /// Applied and verified healthy. Snapshot marked known-good.
    Committed,
    /// Verification failed and the tree was restored to pre-batch state.
    RolledBack,
    /// Verification failed and the automatic rollback also failed.
    /// Manual intervention required.
    RollbackFailed,
    /// Cancelled cooperatively. The tree holds whatever verified-healthy
    /// state existed at cancellation; the snapshot is never known-good.
    Aborted,
}

impl RunDisposition {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, RunDisposition::SnapshotFailed | RunDisposition::RollbackFailed)
    }
}

impl std::fmt::Display for RunDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunDisposition::Rejected => "rejected",
            RunDisposition::SnapshotFailed => "snapshot_failed",
            RunDisposition::Committed => "committed",
            RunDisposition::RolledBack => "rolled_back",
            RunDisposition::RollbackFailed => "rollback_failed",
            RunDisposition::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub disposition: RunDisposition,
    pub snapshot_id: Option<i64>,
    pub per_file: Vec<FileOutcome>,
    pub health: Option<HealthReport>,
    pub health_check_passed: bool,
    pub rolled_back: bool,
    pub validation_errors: Vec<String>,
    pub validation_warnings: Vec<String>,
    /// Operator-facing reason for any non-committed terminal.
    pub failure: Option<String>,
}

impl RunOutcome {
    fn rejected(report: &ValidationReport) -> Self {
        Self {
            disposition: RunDisposition::Rejected,
            snapshot_id: None,
            per_file: Vec::new(),
            health: None,
            health_check_passed: false,
            rolled_back: false,
            validation_errors: report.error_messages(),
            validation_warnings: report.warning_messages(),
            failure: Some("validation rejected the batch".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// RunProgress
// ---------------------------------------------------------------------------

/// Observer for phase transitions during a run. The job tracker implements
/// this to expose `current_phase` to reconnecting callers; tests and
/// standalone callers pass [`NoProgress`].
pub trait RunProgress: Send + Sync {
    fn phase(&self, phase: &str);

    /// Milestones finer than the phase string, such as the id of a captured
    /// snapshot. Ignored unless the observer opts in.
    fn event(&self, _message: &str) {}
}

/// Discards phase transitions.
pub struct NoProgress;

impl RunProgress for NoProgress {
    fn phase(&self, _phase: &str) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The state machine itself. Owns the execution lock and every stage.
pub struct Orchestrator {
    guard: PolicyGuard,
    validator: PreflightValidator,
    applier: MutationApplier,
    verifier: HealthVerifier,
    rollback: RollbackController,
    store: Arc<PipelineStore>,
    fs: Arc<dyn ProjectFs>,
    /// Global execution lock. Held across Validate through terminal so
    /// concurrent runs cannot snapshot each other's partial writes.
    run_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        cfg: &PipelineConfig,
        fs: Arc<dyn ProjectFs>,
        store: Arc<PipelineStore>,
        external: Arc<dyn ExternalCheck>,
    ) -> Self {
        let guard = PolicyGuard::new(cfg.policy.clone(), &cfg.project_root);
        Self {
            validator: PreflightValidator::new(guard.clone(), cfg.limits.clone(), fs.clone()),
            applier: MutationApplier::new(guard.clone(), fs.clone(), store.clone()),
            verifier: HealthVerifier::new(
                cfg.verifier.clone(),
                &cfg.project_root,
                fs.clone(),
                store.clone(),
                external,
            ),
            rollback: RollbackController::new(guard.clone(), fs.clone(), store.clone()),
            guard,
            store,
            fs,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Standalone health check, outside any mutation. Does not take the
    /// execution lock.
    pub async fn health_check(&self, options: &HealthCheckOptions) -> HealthReport {
        self.verifier.run(options).await
    }

    /// Operator-initiated rollback, targeted or last-known-good. Takes the
    /// same execution lock as [`run`](Self::run) so a manual restore cannot
    /// interleave with a live batch.
    pub async fn manual_rollback(
        &self,
        snapshot_id: Option<i64>,
        requested_by: &str,
        user_id: Option<&str>,
    ) -> Result<crate::rollback::RollbackOutcome> {
        let _serial = self.run_lock.lock().await;
        let outcome = match snapshot_id {
            Some(id) => self.rollback.rollback_to_snapshot(id)?,
            None => self.rollback.rollback_to_last_good()?,
        };
        self.log_rollback_markers(
            outcome.snapshot_id,
            "manual rollback",
            None,
            true,
            requested_by,
            user_id,
        );
        Ok(outcome)
    }

    /// Run one batch to a terminal state.
    pub async fn run(
        &self,
        batch: &[ModificationRequest],
        description: &str,
        requested_by: &str,
        user_id: Option<&str>,
        cancel: &CancellationToken,
        progress: &dyn RunProgress,
    ) -> RunOutcome {
        let _serial = self.run_lock.lock().await;
        tracing::info!(
            target: "selfpatch::orchestrator",
            files = batch.len(),
            requested_by = requested_by,
            "Run started"
        );

        // Phase 1: validate. Rejection is terminal with zero writes.
        progress.phase("validating");
        let report = self.validator.validate(batch);
        if !report.is_valid() {
            self.log_rejection(batch, &report, requested_by, user_id);
            tracing::warn!(
                target: "selfpatch::orchestrator",
                errors = report.errors.len(),
                "Run rejected by pre-flight validation"
            );
            return RunOutcome::rejected(&report);
        }

        if cancel.is_cancelled() {
            self.log_cancelled(batch, None, "cancelled before snapshot", requested_by, user_id);
            return self.aborted(None, Vec::new(), None, &report, "cancelled before snapshot");
        }

        // Phase 2: snapshot. Capture strictly precedes any write; a failure
        // here is terminal with the tree untouched.
        progress.phase("snapshotting");
        let snap = match self.take_snapshot(batch, description, requested_by) {
            Ok(snap) => snap,
            Err(e) => {
                let reason = format!("snapshot creation failed: {}", e);
                self.log_snapshot_failure(batch, &reason, requested_by, user_id);
                tracing::error!(target: "selfpatch::orchestrator", error = %e, "Snapshot failed");
                return RunOutcome {
                    disposition: RunDisposition::SnapshotFailed,
                    snapshot_id: None,
                    per_file: Vec::new(),
                    health: None,
                    health_check_passed: false,
                    rolled_back: false,
                    validation_errors: Vec::new(),
                    validation_warnings: report.warning_messages(),
                    failure: Some(reason),
                };
            }
        };
        tracing::info!(
            target: "selfpatch::orchestrator",
            snapshot_id = snap.id,
            file_count = snap.file_count,
            "Snapshot captured"
        );
        progress.event(&format!("captured snapshot {}", snap.id));

        if cancel.is_cancelled() {
            self.log_cancelled(batch, Some(snap.id), "cancelled before apply", requested_by, user_id);
            return self.aborted(Some(snap.id), Vec::new(), None, &report, "cancelled before apply");
        }

        // Phase 3: apply. Best-effort per file; the applier writes one audit
        // entry per attempted operation and stops between files on cancel.
        progress.phase("applying");
        let per_file = self.applier.apply(batch, snap.id, requested_by, user_id, cancel);
        if per_file.len() < batch.len() {
            self.log_cancelled(
                &batch[per_file.len()..],
                Some(snap.id),
                "cancelled before apply",
                requested_by,
                user_id,
            );
        }

        // Phase 4: verify. Runs even after cancellation, against whatever
        // state exists on disk.
        progress.phase("verifying");
        let health = self.verifier.run(&HealthCheckOptions::default()).await;

        // Phase 5: commit or roll back.
        if health.healthy {
            if cancel.is_cancelled() {
                tracing::warn!(
                    target: "selfpatch::orchestrator",
                    snapshot_id = snap.id,
                    applied = per_file.len(),
                    "Run aborted after partial apply; tree verified healthy"
                );
                return self.aborted(
                    Some(snap.id),
                    per_file,
                    Some(health),
                    &report,
                    "cancelled during apply",
                );
            }
            if let Err(e) = self.store.mark_known_good(snap.id) {
                tracing::warn!(
                    target: "selfpatch::orchestrator",
                    snapshot_id = snap.id,
                    error = %e,
                    "Could not mark snapshot known-good"
                );
            }
            tracing::info!(
                target: "selfpatch::orchestrator",
                snapshot_id = snap.id,
                files = per_file.len(),
                "Run committed"
            );
            return RunOutcome {
                disposition: RunDisposition::Committed,
                snapshot_id: Some(snap.id),
                per_file,
                health: Some(health),
                health_check_passed: true,
                rolled_back: false,
                validation_errors: Vec::new(),
                validation_warnings: report.warning_messages(),
                failure: None,
            };
        }

        let failed = health.failed_names();
        tracing::warn!(
            target: "selfpatch::orchestrator",
            snapshot_id = snap.id,
            failed = ?failed,
            "Verification failed; rolling back"
        );
        let reason = PipelineError::HealthCheckFailure { failed }.to_string();
        progress.phase("rolling_back");
        match self.rollback.rollback_to_snapshot(snap.id) {
            Ok(rb) => {
                self.log_rollback_markers(
                    snap.id,
                    "automatic rollback after failed health check",
                    Some(&reason),
                    true,
                    requested_by,
                    user_id,
                );
                tracing::info!(
                    target: "selfpatch::orchestrator",
                    snapshot_id = snap.id,
                    files_restored = rb.files_restored,
                    files_removed = rb.files_removed,
                    "Automatic rollback complete"
                );
                progress.event(&format!("rolled back to snapshot {}", snap.id));
                RunOutcome {
                    disposition: RunDisposition::RolledBack,
                    snapshot_id: Some(snap.id),
                    per_file,
                    health: Some(health),
                    health_check_passed: false,
                    rolled_back: true,
                    validation_errors: Vec::new(),
                    validation_warnings: report.warning_messages(),
                    failure: Some(reason),
                }
            }
            Err(e) => {
                let full = format!("{}; automatic rollback failed: {}", reason, e);
                self.log_rollback_markers(
                    snap.id,
                    "automatic rollback attempt",
                    Some(&full),
                    false,
                    requested_by,
                    user_id,
                );
                tracing::error!(
                    target: "selfpatch::orchestrator",
                    snapshot_id = snap.id,
                    error = %e,
                    "Automatic rollback FAILED; manual intervention required"
                );
                RunOutcome {
                    disposition: RunDisposition::RollbackFailed,
                    snapshot_id: Some(snap.id),
                    per_file,
                    health: Some(health),
                    health_check_passed: false,
                    rolled_back: false,
                    validation_errors: Vec::new(),
                    validation_warnings: report.warning_messages(),
                    failure: Some(full),
                }
            }
        }
    }

    fn take_snapshot(
        &self,
        batch: &[ModificationRequest],
        description: &str,
        requested_by: &str,
    ) -> Result<crate::store::Snapshot> {
        let mut targets: Vec<(String, PathBuf)> = Vec::with_capacity(batch.len());
        for req in batch {
            let rel = self.guard.relative(&req.file_path)?;
            let rel_str = rel.to_string_lossy().into_owned();
            targets.push((rel_str, self.guard.root().join(rel)));
        }
        let captured = capture_files(self.fs.as_ref(), &targets)?;
        self.store.create_snapshot(&captured, description, requested_by)
    }

    fn aborted(
        &self,
        snapshot_id: Option<i64>,
        per_file: Vec<FileOutcome>,
        health: Option<HealthReport>,
        report: &ValidationReport,
        why: &str,
    ) -> RunOutcome {
        tracing::info!(target: "selfpatch::orchestrator", reason = why, "Run aborted");
        let health_check_passed = health.as_ref().map(|h| h.healthy).unwrap_or(false);
        RunOutcome {
            disposition: RunDisposition::Aborted,
            snapshot_id,
            per_file,
            health,
            health_check_passed,
            rolled_back: false,
            validation_errors: Vec::new(),
            validation_warnings: report.warning_messages(),
            failure: Some(why.to_string()),
        }
    }

    // -- audit helpers ------------------------------------------------------

    /// One rejection entry per batch entry, before any snapshot exists.
    fn log_rejection(
        &self,
        batch: &[ModificationRequest],
        report: &ValidationReport,
        requested_by: &str,
        user_id: Option<&str>,
    ) {
        for req in batch {
            let own: Vec<String> = report
                .errors
                .iter()
                .filter(|i| i.path.as_deref() == Some(req.file_path.as_str()))
                .map(|i| i.message.clone())
                .collect();
            let message = if own.is_empty() { "rejected with batch".to_string() } else { own.join("; ") };
            self.record(NewLogEntry {
                snapshot_id: None,
                requested_by: requested_by.to_string(),
                user_id: user_id.map(str::to_string),
                action: req.action.to_string(),
                target_file: req.file_path.clone(),
                description: req.description.clone(),
                validation_result: "failed".into(),
                applied: false,
                rolled_back: false,
                error_message: Some(message),
            });
        }
    }

    fn log_snapshot_failure(
        &self,
        batch: &[ModificationRequest],
        reason: &str,
        requested_by: &str,
        user_id: Option<&str>,
    ) {
        for req in batch {
            self.record(NewLogEntry {
                snapshot_id: None,
                requested_by: requested_by.to_string(),
                user_id: user_id.map(str::to_string),
                action: req.action.to_string(),
                target_file: req.file_path.clone(),
                description: req.description.clone(),
                validation_result: "passed".into(),
                applied: false,
                rolled_back: false,
                error_message: Some(reason.to_string()),
            });
        }
    }

    fn log_cancelled(
        &self,
        unattempted: &[ModificationRequest],
        snapshot_id: Option<i64>,
        why: &str,
        requested_by: &str,
        user_id: Option<&str>,
    ) {
        for req in unattempted {
            self.record(NewLogEntry {
                snapshot_id,
                requested_by: requested_by.to_string(),
                user_id: user_id.map(str::to_string),
                action: req.action.to_string(),
                target_file: req.file_path.clone(),
                description: req.description.clone(),
                validation_result: "passed".into(),
                applied: false,
                rolled_back: false,
                error_message: Some(why.to_string()),
            });
        }
    }

    /// Synthetic per-file markers for a rollback, one per file the snapshot
    /// covers.
    fn log_rollback_markers(
        &self,
        snapshot_id: i64,
        description: &str,
        reason: Option<&str>,
        rolled_back: bool,
        requested_by: &str,
        user_id: Option<&str>,
    ) {
        let files = match self.store.snapshot_files(snapshot_id) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(
                    target: "selfpatch::orchestrator",
                    snapshot_id,
                    error = %e,
                    "Could not load snapshot files for rollback markers"
                );
                return;
            }
        };
        for file in files {
            self.record(NewLogEntry {
                snapshot_id: Some(snapshot_id),
                requested_by: requested_by.to_string(),
                user_id: user_id.map(str::to_string),
                action: "rollback".into(),
                target_file: file.file_path,
                description: description.to_string(),
                validation_result: "passed".into(),
                applied: false,
                rolled_back,
                error_message: reason.map(str::to_string),
            });
        }
    }

    /// Audit writes are best-effort; a failed insert is logged, never fatal.
    fn record(&self, entry: NewLogEntry) {
        if let Err(e) = self.store.record_log(&entry) {
            tracing::warn!(
                target: "selfpatch::orchestrator",
                target_file = %entry.target_file,
                error = %e,
                "Audit log write failed"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
