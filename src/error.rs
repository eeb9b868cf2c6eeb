//! # Module: Pipeline Errors
//!
//! ## Responsibility
//! Crate-level error taxonomy for the mutation pipeline. Every fallible
//! operation returns `Result<T, PipelineError>`; validation findings that do
//! not abort a batch (brace imbalance, delete of a missing file) are carried
//! as report values, never as errors.
//!
//! ## Guarantees
//! - Security failures (`PathTraversal`, `PolicyViolation`, `OutOfScope`)
//!   are distinct variants so callers can never mistake them for I/O noise.
//! - `RollbackFailure` is reported distinctly from ordinary failures: it is
//!   the one state that requires operator intervention.
//! - Store loss maps to `StoreUnavailable` and the pipeline fails closed: no
//!   reachable store means no snapshot, which means no mutation is attempted.

use uuid::Uuid;

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Everything that can go wrong between "batch submitted" and a terminal
/// pipeline state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A candidate path resolved outside the project root. Always fatal for
    /// the whole batch, caught before any validation work.
    #[error("path escapes the project root: {path}")]
    PathTraversal { path: String },

    /// The path matched the protected deny-list. No privilege level
    /// overrides this.
    #[error("protected path may not be modified: {path}")]
    PolicyViolation { path: String },

    /// The path is inside the root but under no modifiable source root.
    #[error("path is outside the modifiable source roots: {path}")]
    OutOfScope { path: String },

    /// Proposed content exceeds the per-file byte cap. The display omits the
    /// path: the carrying `ValidationIssue` or log row names it.
    #[error("{bytes} bytes exceeds the {limit} byte limit")]
    SizeLimitExceeded { path: String, bytes: usize, limit: usize },

    /// Proposed content contains a known-destructive construct. Path omitted
    /// from the display for the same reason as `SizeLimitExceeded`.
    #[error("content contains dangerous pattern `{pattern}`")]
    DangerousPattern { path: String, pattern: String },

    /// A single file write failed during apply. The batch continues; the
    /// health verifier decides the overall outcome.
    #[error("write failed for {path}: {reason}")]
    WriteFailure { path: String, reason: String },

    /// Post-apply verification failed and triggered automatic rollback.
    #[error("health check failed: [{}]", failed.join(", "))]
    HealthCheckFailure { failed: Vec<String> },

    /// Restoration itself failed. Manual intervention required.
    #[error("rollback failed: {reason}")]
    RollbackFailure { reason: String },

    /// The SQLite store cannot be reached or refused the operation.
    #[error("persistent store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// Lookup of a snapshot id that does not exist.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(i64),

    /// Lookup of a background job that never existed or whose record has
    /// already been swept.
    #[error("job {0} not found (completed jobs are retained briefly, then discarded)")]
    JobNotFound(Uuid),

    /// The task driving a background job stopped without recording a result.
    #[error("job {0} terminated without a result")]
    JobInterrupted(Uuid),

    /// Caller lacks the privilege a mutating operation requires.
    #[error("operation requires elevated privilege")]
    PrivilegeRequired,

    /// Configuration could not be loaded or failed a sanity bound.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// True for the security-classified rejections that must invalidate an
    /// entire batch regardless of any other finding.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::PathTraversal { .. }
                | PipelineError::PolicyViolation { .. }
                | PipelineError::OutOfScope { .. }
        )
    }

    /// True when the error leaves the live tree in a state an operator must
    /// inspect by hand.
    pub fn needs_operator(&self) -> bool {
        matches!(self, PipelineError::RollbackFailure { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_display_names_path() {
        let e = PipelineError::PathTraversal { path: "../../etc/passwd".into() };
        assert!(e.to_string().contains("../../etc/passwd"));
    }

    #[test]
    fn test_policy_violation_display_names_path() {
        let e = PipelineError::PolicyViolation { path: "server/_core/auth.rs".into() };
        assert!(e.to_string().contains("server/_core/auth.rs"));
    }

    #[test]
    fn test_size_limit_display_carries_both_numbers() {
        let e = PipelineError::SizeLimitExceeded { path: "a.rs".into(), bytes: 200_000, limit: 102_400 };
        let s = e.to_string();
        assert!(s.contains("200000"));
        assert!(s.contains("102400"));
        assert!(!s.contains("a.rs"), "issue rendering supplies the path");
    }

    #[test]
    fn test_dangerous_pattern_display_names_pattern_not_path() {
        let e = PipelineError::DangerousPattern { path: "a.rs".into(), pattern: "rm -rf".into() };
        let s = e.to_string();
        assert!(s.contains("rm -rf"));
        assert!(!s.contains("a.rs"), "issue rendering supplies the path");
    }

    #[test]
    fn test_health_failure_display_joins_check_names() {
        let e = PipelineError::HealthCheckFailure { failed: vec!["type_check".into(), "tests".into()] };
        let s = e.to_string();
        assert!(s.contains("type_check"));
        assert!(s.contains("tests"));
    }

    #[test]
    fn test_security_violation_classification() {
        assert!(PipelineError::PathTraversal { path: "x".into() }.is_security_violation());
        assert!(PipelineError::PolicyViolation { path: "x".into() }.is_security_violation());
        assert!(PipelineError::OutOfScope { path: "x".into() }.is_security_violation());
        assert!(!PipelineError::Config("x".into()).is_security_violation());
    }

    #[test]
    fn test_rollback_failure_needs_operator() {
        let e = PipelineError::RollbackFailure { reason: "hash mismatch".into() };
        assert!(e.needs_operator());
        assert!(!PipelineError::PrivilegeRequired.needs_operator());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: PipelineError = io.into();
        assert!(matches!(e, PipelineError::Io(_)));
    }
}
