//! # Stage: Background Job Tracker
//!
//! ## Responsibility
//! Run orchestrator work independently of the connection that started it.
//! Each job owns a cancellation token and a watch channel; observers attach
//! and detach freely, and detaching never cancels anything. The only way to
//! stop a running job is the explicit [`JobTracker::cancel`] call.
//!
//! Finished jobs stay queryable for a bounded retention window so a
//! disconnected caller can reconnect and fetch the outcome, then they are
//! swept.
//!
//! ## Guarantees
//! - All job state lives behind one mutex inside the tracker; there are no
//!   ambient globals.
//! - Terminal job records survive `retention_secs` after completion.
//!
//! ## NOT Responsible For
//! - Spawning the orchestrator future (service layer)
//! - The run's own phase sequencing (orchestrator)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{RunDisposition, RunOutcome, RunProgress};
use crate::store::now_ms;

// ---------------------------------------------------------------------------
// JobStatus / JobView
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of one job, safe to hand to observers and serialize over the
/// wire.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub current_phase: String,
    /// Phase transitions completed so far.
    pub steps_completed: u32,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub last_event: Option<String>,
    pub result: Option<RunOutcome>,
}

struct JobEntry {
    view: JobView,
    tx: watch::Sender<JobView>,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

// ---------------------------------------------------------------------------
// JobTracker
// ---------------------------------------------------------------------------

/// Registry of background jobs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    retention: Duration,
}

impl JobTracker {
    pub fn new(config: &JobsConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            retention: Duration::from_secs(config.retention_secs),
        }
    }

    /// Register a new running job and hand back its handle. Sweeps expired
    /// records first, so a submit-only caller cannot grow the registry
    /// without bound.
    pub fn create(&self) -> JobHandle {
        let id = Uuid::new_v4();
        let view = JobView {
            job_id: id,
            status: JobStatus::Running,
            current_phase: "queued".into(),
            steps_completed: 0,
            started_at_ms: now_ms(),
            completed_at_ms: None,
            last_event: None,
            result: None,
        };
        let (tx, _rx) = watch::channel(view.clone());
        let cancel = CancellationToken::new();
        let entry = JobEntry { view, tx, cancel: cancel.clone(), finished_at: None };
        {
            let mut jobs = self.lock();
            Self::sweep(&mut jobs, self.retention);
            jobs.insert(id, entry);
        }
        tracing::debug!(target: "selfpatch::jobs", job_id = %id, "Job registered");
        JobHandle { id, tracker: self.clone(), cancel }
    }

    /// Current state of one job. Sweeps expired records first.
    pub fn status(&self, id: Uuid) -> Result<JobView> {
        let mut jobs = self.lock();
        Self::sweep(&mut jobs, self.retention);
        jobs.get(&id).map(|e| e.view.clone()).ok_or(PipelineError::JobNotFound(id))
    }

    /// Attach an observer. Dropping the receiver detaches without touching
    /// the job.
    pub fn watch(&self, id: Uuid) -> Result<watch::Receiver<JobView>> {
        let mut jobs = self.lock();
        Self::sweep(&mut jobs, self.retention);
        jobs.get(&id).map(|e| e.tx.subscribe()).ok_or(PipelineError::JobNotFound(id))
    }

    /// Explicit cancellation. Signals the job's token; the run notices at
    /// its next phase or file boundary. Status flips to `aborted` only when
    /// the run itself finishes.
    pub fn cancel(&self, id: Uuid) -> Result<JobView> {
        let mut jobs = self.lock();
        Self::sweep(&mut jobs, self.retention);
        let entry = jobs.get_mut(&id).ok_or(PipelineError::JobNotFound(id))?;
        if !entry.view.status.is_terminal() {
            entry.cancel.cancel();
            entry.view.last_event = Some("cancellation requested".into());
            let _ = entry.tx.send_replace(entry.view.clone());
            tracing::info!(target: "selfpatch::jobs", job_id = %id, "Cancellation requested");
        }
        Ok(entry.view.clone())
    }

    /// All known jobs, newest first.
    pub fn list(&self) -> Vec<JobView> {
        let mut jobs = self.lock();
        Self::sweep(&mut jobs, self.retention);
        let mut out: Vec<JobView> = jobs.values().map(|e| e.view.clone()).collect();
        out.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms));
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drop terminal records older than the retention window. Running jobs
    /// are never swept.
    fn sweep(jobs: &mut HashMap<Uuid, JobEntry>, retention: Duration) {
        jobs.retain(|_, e| match e.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut JobEntry)) {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(&id) {
            f(entry);
            let _ = entry.tx.send_replace(entry.view.clone());
        }
    }
}

fn status_for(disposition: RunDisposition) -> JobStatus {
    match disposition {
        RunDisposition::Aborted => JobStatus::Aborted,
        RunDisposition::SnapshotFailed | RunDisposition::RollbackFailed => JobStatus::Failed,
        _ => JobStatus::Completed,
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Write side of one job, held by the task driving it.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    tracker: JobTracker,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_phase(&self, phase: &str) {
        self.tracker.update(self.id, |entry| {
            entry.view.current_phase = phase.to_string();
            entry.view.steps_completed += 1;
        });
    }

    pub fn event(&self, message: impl Into<String>) {
        self.tracker.update(self.id, |entry| {
            entry.view.last_event = Some(message.into());
        });
    }

    /// Record the run's terminal outcome and start the retention clock.
    pub fn finish(&self, outcome: RunOutcome) {
        let status = status_for(outcome.disposition);
        tracing::info!(
            target: "selfpatch::jobs",
            job_id = %self.id,
            status = %status,
            disposition = %outcome.disposition,
            "Job finished"
        );
        self.tracker.update(self.id, |entry| {
            entry.view.status = status;
            entry.view.completed_at_ms = Some(now_ms());
            entry.view.current_phase = "done".into();
            entry.view.result = Some(outcome);
            entry.finished_at = Some(Instant::now());
        });
    }
}

impl RunProgress for JobHandle {
    fn phase(&self, phase: &str) {
        self.set_phase(phase);
    }

    fn event(&self, message: &str) {
        JobHandle::event(self, message);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> JobTracker {
        JobTracker::new(&JobsConfig::default())
    }

    fn outcome(disposition: RunDisposition) -> RunOutcome {
        RunOutcome {
            disposition,
            snapshot_id: None,
            per_file: Vec::new(),
            health: None,
            health_check_passed: disposition == RunDisposition::Committed,
            rolled_back: disposition == RunDisposition::RolledBack,
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
            failure: None,
        }
    }

    #[test]
    fn test_new_job_is_running() {
        let t = tracker();
        let handle = t.create();
        let view = t.status(handle.id()).unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.current_phase, "queued");
        assert!(view.result.is_none());
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let id = Uuid::new_v4();
        assert!(matches!(tracker().status(id).unwrap_err(), PipelineError::JobNotFound(got) if got == id));
    }

    #[test]
    fn test_finish_committed_maps_to_completed() {
        let t = tracker();
        let handle = t.create();
        handle.finish(outcome(RunDisposition::Committed));
        let view = t.status(handle.id()).unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert!(view.completed_at_ms.is_some());
        assert!(view.result.is_some());
    }

    #[test]
    fn test_finish_rejected_still_counts_as_completed() {
        // a rejected batch is a run that finished its protocol
        let t = tracker();
        let handle = t.create();
        handle.finish(outcome(RunDisposition::Rejected));
        assert_eq!(t.status(handle.id()).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_finish_rollback_failed_maps_to_failed() {
        let t = tracker();
        let handle = t.create();
        handle.finish(outcome(RunDisposition::RollbackFailed));
        assert_eq!(t.status(handle.id()).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_finish_aborted_maps_to_aborted() {
        let t = tracker();
        let handle = t.create();
        handle.finish(outcome(RunDisposition::Aborted));
        assert_eq!(t.status(handle.id()).unwrap().status, JobStatus::Aborted);
    }

    #[test]
    fn test_cancel_signals_token_without_flipping_status() {
        let t = tracker();
        let handle = t.create();
        let view = t.cancel(handle.id()).unwrap();
        assert!(handle.cancel_token().is_cancelled());
        // still running until the run itself notices and finishes
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.last_event.as_deref(), Some("cancellation requested"));
    }

    #[test]
    fn test_cancel_after_finish_is_noop() {
        let t = tracker();
        let handle = t.create();
        handle.finish(outcome(RunDisposition::Committed));
        let view = t.cancel(handle.id()).unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert!(!handle.cancel_token().is_cancelled());
        assert!(view.last_event.is_none());
    }

    #[test]
    fn test_cancel_unknown_job_is_not_found() {
        assert!(matches!(
            tracker().cancel(Uuid::new_v4()).unwrap_err(),
            PipelineError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_watch_observes_phase_transitions() {
        let t = tracker();
        let handle = t.create();
        let mut rx = t.watch(handle.id()).unwrap();
        handle.set_phase("validating");
        rx.changed().await.unwrap();
        let view = rx.borrow().clone();
        assert_eq!(view.current_phase, "validating");
        assert_eq!(view.steps_completed, 1);
    }

    #[test]
    fn test_event_updates_last_event() {
        let t = tracker();
        let handle = t.create();
        handle.event("captured snapshot 3");
        assert_eq!(
            t.status(handle.id()).unwrap().last_event.as_deref(),
            Some("captured snapshot 3")
        );
    }

    #[test]
    fn test_detaching_observer_never_cancels() {
        let t = tracker();
        let handle = t.create();
        let rx = t.watch(handle.id()).unwrap();
        drop(rx);
        handle.set_phase("applying");
        assert!(!handle.cancel_token().is_cancelled());
        assert_eq!(t.status(handle.id()).unwrap().current_phase, "applying");
    }

    #[test]
    fn test_finished_jobs_swept_after_retention() {
        let t = JobTracker::new(&JobsConfig { retention_secs: 0 });
        let handle = t.create();
        handle.finish(outcome(RunDisposition::Committed));
        // zero retention sweeps on the next access
        assert!(matches!(t.status(handle.id()).unwrap_err(), PipelineError::JobNotFound(_)));
    }

    #[test]
    fn test_running_jobs_survive_zero_retention() {
        let t = JobTracker::new(&JobsConfig { retention_secs: 0 });
        let handle = t.create();
        assert!(t.status(handle.id()).is_ok());
    }

    #[test]
    fn test_create_sweeps_expired_records() {
        let t = JobTracker::new(&JobsConfig { retention_secs: 0 });
        let old = t.create();
        let rx = t.watch(old.id()).unwrap();
        old.finish(outcome(RunDisposition::Committed));
        // registering a new job alone reclaims the expired record
        let _fresh = t.create();
        assert!(rx.has_changed().is_err(), "swept entry should close its channel");
    }

    #[test]
    fn test_list_newest_first() {
        let t = tracker();
        let _a = t.create();
        std::thread::sleep(Duration::from_millis(5));
        let b = t.create();
        let listed = t.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].job_id, b.id());
    }
}
