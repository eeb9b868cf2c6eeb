//! # Stage: Pipeline Service
//!
//! ## Responsibility
//! The surface the calling agent talks to: file reads under the allow-list
//! rule, batch proposal, standalone health checks, targeted and last-good
//! rollback, restart signalling, history, and job status for reconnecting
//! callers.
//!
//! Write operations require an elevated [`RequestContext`]; privilege comes
//! from a constant-time comparison against the configured admin token.
//! Proposals run inside a background job, so a caller that disconnects
//! mid-run can fetch the outcome later by job id.
//!
//! ## NOT Responsible For
//! - Phase sequencing and rollback decisions (orchestrator)
//! - Path classification rules (policy guard)

use std::sync::Arc;

use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use uuid::Uuid;

use crate::batch::ModificationRequest;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fsio::{DirEntryInfo, OsFs, ProjectFs};
use crate::health::{CommandCheck, ExternalCheck, HealthCheckOptions, HealthReport};
use crate::jobs::{JobTracker, JobView};
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::policy::PolicyGuard;
use crate::rollback::RollbackOutcome;
use crate::store::{now_ms, ModificationLogEntry, PipelineStore, Snapshot};

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Who is asking, and with what privilege. Build through
/// [`PipelineService::context`] so privilege is derived from the token
/// check, never asserted by the caller payload.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub requested_by: String,
    pub user_id: Option<String>,
    privileged: bool,
}

impl RequestContext {
    pub fn new(requested_by: impl Into<String>) -> Self {
        Self { requested_by: requested_by.into(), user_id: None, privileged: false }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn elevated(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// What a proposal call returns: the run's terminal outcome plus the job id
/// a disconnected caller can poll.
#[derive(Debug, Clone, Serialize)]
pub struct ProposeReceipt {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartAck {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub protected_paths: Vec<String>,
    pub allowed_directories: Vec<String>,
}

// ---------------------------------------------------------------------------
// PipelineService
// ---------------------------------------------------------------------------

pub struct PipelineService {
    config: PipelineConfig,
    guard: PolicyGuard,
    fs: Arc<dyn ProjectFs>,
    store: Arc<PipelineStore>,
    orchestrator: Arc<Orchestrator>,
    tracker: JobTracker,
}

impl PipelineService {
    /// Production wiring: OS filesystem, SQLite at the configured path,
    /// subprocess-backed external checks.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let fs: Arc<dyn ProjectFs> = Arc::new(OsFs);
        let store = Arc::new(PipelineStore::open(&config.database_path())?);
        let external: Arc<dyn ExternalCheck> = Arc::new(CommandCheck::new(&config.project_root));
        Ok(Self::with_parts(config, fs, store, external))
    }

    /// Explicit wiring for tests and embedders.
    pub fn with_parts(
        config: PipelineConfig,
        fs: Arc<dyn ProjectFs>,
        store: Arc<PipelineStore>,
        external: Arc<dyn ExternalCheck>,
    ) -> Self {
        let guard = PolicyGuard::new(config.policy.clone(), &config.project_root);
        let orchestrator =
            Arc::new(Orchestrator::new(&config, fs.clone(), store.clone(), external));
        let tracker = JobTracker::new(&config.jobs);
        Self { config, guard, fs, store, orchestrator, tracker }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -- authentication -----------------------------------------------------

    /// Constant-time token check. No configured token leaves writes open,
    /// for single-user development setups.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match (&self.config.admin_token, token) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(got)) => expected.as_bytes().ct_eq(got.as_bytes()).into(),
        }
    }

    /// Build a caller context; privilege is decided here by the token check.
    pub fn context(
        &self,
        requested_by: impl Into<String>,
        user_id: Option<String>,
        token: Option<&str>,
    ) -> RequestContext {
        let mut ctx = RequestContext::new(requested_by);
        ctx.user_id = user_id;
        if self.authorize(token) {
            ctx = ctx.elevated();
        }
        ctx
    }

    fn require_privilege(&self, ctx: &RequestContext) -> Result<()> {
        if ctx.privileged {
            Ok(())
        } else {
            Err(PipelineError::PrivilegeRequired)
        }
    }

    // -- read surface -------------------------------------------------------

    /// Read one file under the allow-listed roots. Protected files are
    /// readable; secrets outside every allowed root are not.
    pub fn read_file(&self, path: &str) -> Result<String> {
        let rel = self.guard.check_readable(path)?;
        let content = self.fs.read_string(&self.guard.root().join(rel))?;
        Ok(content)
    }

    /// List a directory under the allow-listed roots.
    pub fn list_files(&self, dir: &str) -> Result<Vec<DirEntryInfo>> {
        let rel = self.guard.check_readable(dir)?;
        let entries = self.fs.list_dir(&self.guard.root().join(rel))?;
        Ok(entries)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<ModificationLogEntry>> {
        self.store.history(limit)
    }

    pub fn snapshots(&self, limit: usize) -> Result<Vec<Snapshot>> {
        self.store.list_snapshots(limit)
    }

    pub fn policy(&self) -> PolicySummary {
        PolicySummary {
            protected_paths: self.config.policy.protected_paths.clone(),
            allowed_directories: self.config.policy.allowed_roots.clone(),
        }
    }

    /// Standalone health check, outside any mutation.
    pub async fn run_health_check(&self, options: &HealthCheckOptions) -> HealthReport {
        self.orchestrator.health_check(options).await
    }

    // -- write surface ------------------------------------------------------

    /// Submit a batch. The orchestrator runs inside a background job; this
    /// future resolving is how an attached caller gets the outcome, and
    /// dropping it does not stop the run.
    pub async fn propose_modification(
        &self,
        ctx: &RequestContext,
        batch: Vec<ModificationRequest>,
        description: String,
    ) -> Result<ProposeReceipt> {
        self.require_privilege(ctx)?;
        let handle = self.tracker.create();
        let job_id = handle.id();
        let orchestrator = self.orchestrator.clone();
        let cancel = handle.cancel_token();
        let requested_by = ctx.requested_by.clone();
        let user_id = ctx.user_id.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let progress = handle.clone();
        tokio::spawn(async move {
            let outcome = orchestrator
                .run(&batch, &description, &requested_by, user_id.as_deref(), &cancel, &progress)
                .await;
            progress.finish(outcome.clone());
            let _ = done_tx.send(outcome);
        });

        match done_rx.await {
            Ok(outcome) => Ok(ProposeReceipt { job_id, outcome }),
            Err(_) => Err(PipelineError::JobInterrupted(job_id)),
        }
    }

    /// Targeted (`Some(id)`) or last-known-good (`None`) rollback.
    pub async fn rollback(
        &self,
        ctx: &RequestContext,
        snapshot_id: Option<i64>,
    ) -> Result<RollbackOutcome> {
        self.require_privilege(ctx)?;
        self.orchestrator
            .manual_rollback(snapshot_id, &ctx.requested_by, ctx.user_id.as_deref())
            .await
    }

    /// Best-effort restart signal: drop a sentinel file a process supervisor
    /// polls. Never synchronous; the ack only says the signal was recorded.
    pub fn request_restart(&self, ctx: &RequestContext, reason: &str) -> Result<RestartAck> {
        self.require_privilege(ctx)?;
        let payload = serde_json::json!({
            "reason": reason,
            "requested_by": ctx.requested_by,
            "requested_at_ms": now_ms(),
        });
        let body = serde_json::to_vec_pretty(&payload)?;
        let path = self.config.restart_sentinel_path();
        match self.fs.write(&path, &body) {
            Ok(()) => {
                tracing::info!(
                    target: "selfpatch::service",
                    reason = reason,
                    sentinel = %path.display(),
                    "Restart requested"
                );
                Ok(RestartAck {
                    accepted: true,
                    message: "restart requested; the supervisor acts on the sentinel file".into(),
                })
            }
            Err(e) => Ok(RestartAck {
                accepted: false,
                message: format!("could not record restart request: {}", e),
            }),
        }
    }

    // -- background jobs ----------------------------------------------------

    pub fn job_status(&self, id: Uuid) -> Result<JobView> {
        self.tracker.status(id)
    }

    /// Attach to a running job's progress stream. Detaching never cancels.
    pub fn watch_job(&self, id: Uuid) -> Result<watch::Receiver<JobView>> {
        self.tracker.watch(id)
    }

    /// Explicit, authenticated cancellation; the only way to stop a run.
    pub fn cancel_job(&self, ctx: &RequestContext, id: Uuid) -> Result<JobView> {
        self.require_privilege(ctx)?;
        self.tracker.cancel(id)
    }

    pub fn jobs(&self) -> Vec<JobView> {
        self.tracker.list()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
