//! # Stage: Mutation Applier
//!
//! ## Responsibility
//! Write a validated batch to the tree, one entry at a time in batch order.
//! Create ensures parent directories; modify fails its own entry when the
//! target is missing; delete of a missing file is a no-op. Every attempt
//! gets exactly one modification-log row, success or failure.
//!
//! The apply phase is best-effort: a failed entry does not stop the batch.
//! Whether the overall result stands is the health verifier's call, never
//! this module's.
//!
//! ## Guarantees
//! - Runs strictly after snapshot capture; never consulted before it.
//! - Cancellation is honored between files, never mid-write.
//! - The protected deny-list holds at write time: a protected target fails
//!   its entry even when the applier is driven without a pre-flight pass.
//!
//! ## NOT Responsible For
//! - Content vetting (already done in pre-flight)
//! - Rollback (rollback controller)

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::batch::{FileAction, ModificationRequest};
use crate::error::PipelineError;
use crate::fsio::ProjectFs;
use crate::policy::PolicyGuard;
use crate::store::{NewLogEntry, PipelineStore};

// ---------------------------------------------------------------------------
// FileOutcome
// ---------------------------------------------------------------------------

/// Result of one attempted file operation.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file_path: String,
    pub action: FileAction,
    pub success: bool,
    pub error: Option<String>,
}

impl FileOutcome {
    fn ok(req: &ModificationRequest) -> Self {
        Self {
            file_path: req.file_path.clone(),
            action: req.action,
            success: true,
            error: None,
        }
    }

    fn failed(req: &ModificationRequest, error: impl Into<String>) -> Self {
        Self {
            file_path: req.file_path.clone(),
            action: req.action,
            success: false,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// MutationApplier
// ---------------------------------------------------------------------------

/// The write stage. Holds the guard for path resolution, the filesystem
/// port, and the store for audit rows.
pub struct MutationApplier {
    guard: PolicyGuard,
    fs: Arc<dyn ProjectFs>,
    store: Arc<PipelineStore>,
}

impl MutationApplier {
    pub fn new(guard: PolicyGuard, fs: Arc<dyn ProjectFs>, store: Arc<PipelineStore>) -> Self {
        Self { guard, fs, store }
    }

    /// Apply `batch` in order. Returns one outcome per attempted entry;
    /// entries after a cancellation point are not attempted and produce no
    /// outcome.
    pub fn apply(
        &self,
        batch: &[ModificationRequest],
        snapshot_id: i64,
        requested_by: &str,
        user_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Vec<FileOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for req in batch {
            if cancel.is_cancelled() {
                tracing::warn!(
                    target: "selfpatch::applier",
                    snapshot_id,
                    attempted = outcomes.len(),
                    total = batch.len(),
                    "Apply cancelled between files"
                );
                break;
            }
            let outcome = match self.apply_one(req) {
                Ok(()) => {
                    tracing::info!(
                        target: "selfpatch::applier",
                        file = %req.file_path,
                        action = %req.action,
                        "Applied"
                    );
                    FileOutcome::ok(req)
                }
                Err(reason) => {
                    tracing::warn!(
                        target: "selfpatch::applier",
                        file = %req.file_path,
                        action = %req.action,
                        reason = %reason,
                        "Apply failed for file"
                    );
                    FileOutcome::failed(req, reason)
                }
            };
            self.log_attempt(req, snapshot_id, requested_by, user_id, &outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn apply_one(&self, req: &ModificationRequest) -> std::result::Result<(), String> {
        let rel = self.guard.check_writable(&req.file_path).map_err(|e| e.to_string())?;
        let abs = self.guard.root().join(rel);
        let write_failed = |e: std::io::Error| {
            PipelineError::WriteFailure { path: req.file_path.clone(), reason: e.to_string() }
                .to_string()
        };
        match req.action {
            FileAction::Create | FileAction::Modify => {
                if req.action == FileAction::Modify && !self.fs.exists(&abs) {
                    return Err("target file does not exist".into());
                }
                let content = req.content.as_deref().ok_or("request carries no content")?;
                self.fs.write(&abs, content.as_bytes()).map_err(write_failed)
            }
            FileAction::Delete => {
                if self.fs.exists(&abs) {
                    self.fs.remove(&abs).map_err(write_failed)
                } else {
                    // validated as a warning already; applying it is a no-op
                    Ok(())
                }
            }
        }
    }

    fn log_attempt(
        &self,
        req: &ModificationRequest,
        snapshot_id: i64,
        requested_by: &str,
        user_id: Option<&str>,
        outcome: &FileOutcome,
    ) {
        let entry = NewLogEntry {
            snapshot_id: Some(snapshot_id),
            requested_by: requested_by.to_string(),
            user_id: user_id.map(str::to_string),
            action: req.action.to_string(),
            target_file: req.file_path.clone(),
            description: req.description.clone(),
            validation_result: "passed".to_string(),
            applied: outcome.success,
            rolled_back: false,
            error_message: outcome.error.clone(),
        };
        // the write already happened; a failed audit row degrades the log
        // but must not abort the batch mid-apply
        if let Err(e) = self.store.record_log(&entry) {
            tracing::warn!(
                target: "selfpatch::applier",
                file = %req.file_path,
                error = %e,
                "Could not record modification log entry"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::fsio::MemFs;
    use std::path::Path;

    struct Fixture {
        fs: Arc<MemFs>,
        store: Arc<PipelineStore>,
        applier: MutationApplier,
    }

    fn fixture() -> Fixture {
        let fs = Arc::new(MemFs::new());
        fs.seed("/proj/src/existing.rs", b"fn old() {}\n");
        let store = Arc::new(PipelineStore::open_in_memory().unwrap());
        let applier = MutationApplier::new(
            PolicyGuard::new(PolicyConfig::default(), "/proj"),
            fs.clone(),
            store.clone(),
        );
        Fixture { fs, store, applier }
    }

    fn apply(fx: &Fixture, batch: &[ModificationRequest]) -> Vec<FileOutcome> {
        fx.applier.apply(batch, 1, "agent", Some("user-1"), &CancellationToken::new())
    }

    #[test]
    fn test_create_writes_file() {
        let fx = fixture();
        let outcomes = apply(&fx, &[ModificationRequest::create("src/new.rs", "fn n() {}", "add")]);
        assert!(outcomes[0].success);
        assert_eq!(fx.fs.read(Path::new("/proj/src/new.rs")).unwrap(), b"fn n() {}");
    }

    #[test]
    fn test_create_in_new_subdirectory() {
        let fx = fixture();
        let outcomes =
            apply(&fx, &[ModificationRequest::create("src/util/fmt.rs", "pub fn f() {}", "add")]);
        assert!(outcomes[0].success);
        assert!(fx.fs.exists(Path::new("/proj/src/util/fmt.rs")));
    }

    #[test]
    fn test_modify_overwrites_existing() {
        let fx = fixture();
        let outcomes =
            apply(&fx, &[ModificationRequest::modify("src/existing.rs", "fn new() {}\n", "swap")]);
        assert!(outcomes[0].success);
        assert_eq!(fx.fs.read(Path::new("/proj/src/existing.rs")).unwrap(), b"fn new() {}\n");
    }

    #[test]
    fn test_modify_missing_fails_entry_only() {
        let fx = fixture();
        let batch = vec![
            ModificationRequest::modify("src/ghost.rs", "x", "bad"),
            ModificationRequest::create("src/after.rs", "fn a() {}", "still runs"),
        ];
        let outcomes = apply(&fx, &batch);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap().contains("does not exist"));
        // best-effort: the next entry was still attempted and succeeded
        assert!(outcomes[1].success);
        assert!(fx.fs.exists(Path::new("/proj/src/after.rs")));
    }

    #[test]
    fn test_protected_target_fails_its_entry() {
        // the write gate holds even without a pre-flight pass
        let fx = fixture();
        let outcomes = apply(&fx, &[ModificationRequest::modify(".env", "X=1\n", "tamper")]);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap().contains("protected path"));
        assert!(!fx.fs.exists(Path::new("/proj/.env")));
    }

    /// Fails every write.
    struct ReadOnlyFs;

    impl ProjectFs for ReadOnlyFs {
        fn read(&self, _path: &Path) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
        }
        fn write(&self, _path: &Path, _content: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only filesystem"))
        }
        fn remove(&self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only filesystem"))
        }
        fn exists(&self, _path: &Path) -> bool {
            false
        }
        fn list_dir(&self, _path: &Path) -> std::io::Result<Vec<crate::fsio::DirEntryInfo>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_failed_write_reports_write_failure() {
        let store = Arc::new(PipelineStore::open_in_memory().unwrap());
        let applier = MutationApplier::new(
            PolicyGuard::new(PolicyConfig::default(), "/proj"),
            Arc::new(ReadOnlyFs),
            store.clone(),
        );
        let outcomes = applier.apply(
            &[ModificationRequest::create("src/new.rs", "fn n() {}", "add")],
            1,
            "agent",
            None,
            &CancellationToken::new(),
        );
        assert!(!outcomes[0].success);
        let msg = outcomes[0].error.as_deref().unwrap();
        assert!(msg.contains("write failed for src/new.rs"));
        assert!(msg.contains("read-only filesystem"));
        // the failure still leaves an audit row
        assert!(!store.history(1).unwrap()[0].applied);
    }

    #[test]
    fn test_delete_removes_existing() {
        let fx = fixture();
        let outcomes = apply(&fx, &[ModificationRequest::delete("src/existing.rs", "drop")]);
        assert!(outcomes[0].success);
        assert!(!fx.fs.exists(Path::new("/proj/src/existing.rs")));
    }

    #[test]
    fn test_delete_missing_is_noop_success() {
        let fx = fixture();
        let outcomes = apply(&fx, &[ModificationRequest::delete("src/ghost.rs", "noop")]);
        assert!(outcomes[0].success);
    }

    #[test]
    fn test_every_attempt_gets_a_log_row() {
        let fx = fixture();
        let batch = vec![
            ModificationRequest::create("src/a.rs", "fn a() {}", "a"),
            ModificationRequest::modify("src/ghost.rs", "x", "fails"),
            ModificationRequest::delete("src/existing.rs", "d"),
        ];
        apply(&fx, &batch);
        let history = fx.store.history(10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|e| e.snapshot_id == Some(1)));
        let failed = history.iter().find(|e| e.target_file == "src/ghost.rs").unwrap();
        assert!(!failed.applied);
        assert!(failed.error_message.is_some());
    }

    #[test]
    fn test_log_row_carries_attribution() {
        let fx = fixture();
        apply(&fx, &[ModificationRequest::create("src/a.rs", "fn a() {}", "a")]);
        let e = &fx.store.history(1).unwrap()[0];
        assert_eq!(e.requested_by, "agent");
        assert_eq!(e.user_id.as_deref(), Some("user-1"));
        assert_eq!(e.action, "create");
    }

    #[test]
    fn test_precancelled_token_attempts_nothing() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcomes = fx.applier.apply(
            &[ModificationRequest::create("src/new.rs", "fn n() {}", "add")],
            1,
            "agent",
            None,
            &cancel,
        );
        assert!(outcomes.is_empty());
        assert!(!fx.fs.exists(Path::new("/proj/src/new.rs")));
        assert!(fx.store.history(10).unwrap().is_empty());
    }

    #[test]
    fn test_batch_applies_in_submission_order() {
        let fx = fixture();
        let batch = vec![
            ModificationRequest::create("src/one.rs", "fn one() {}", "first"),
            ModificationRequest::modify("src/one.rs", "fn one_v2() {}", "second touches first"),
        ];
        let outcomes = apply(&fx, &batch);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(fx.fs.read(Path::new("/proj/src/one.rs")).unwrap(), b"fn one_v2() {}");
    }
}
