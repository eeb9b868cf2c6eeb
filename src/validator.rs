//! # Stage: Pre-flight Validation
//!
//! ## Responsibility
//! Decide whether a batch is safe enough to attempt, before anything is
//! snapshotted or written. Rule battery (every rule always runs, findings
//! accumulate, nothing short-circuits):
//!
//! 1. Batch size cap
//! 2. Policy guard pass over every path (traversal, protected, out of scope)
//! 3. Per-file content size cap
//! 4. Destructive-pattern scan (errors)
//! 5. Brace/paren balance heuristic on source-like files (warning only)
//! 6. Delete-of-nonexistent detection (warning only)
//!
//! ## Guarantees
//! - Pure with respect to the tree: reads existence, writes nothing.
//! - Repeatable: same batch, same report.
//! - A single protected or escaping path invalidates the entire batch.
//!
//! ## NOT Responsible For
//! - Semantic correctness of the proposed code (the health verifier owns the
//!   post-apply judgment)

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::batch::{FileAction, ModificationRequest};
use crate::config::LimitsConfig;
use crate::error::PipelineError;
use crate::fsio::ProjectFs;
use crate::policy::{PathClass, PolicyGuard};

// ---------------------------------------------------------------------------
// ValidationIssue / ValidationReport
// ---------------------------------------------------------------------------

/// One finding from the rule battery. `path` is `None` for batch-level
/// findings such as the size cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn batch(message: impl Into<String>) -> Self {
        Self { path: None, message: message.into() }
    }

    pub fn file(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: Some(path.into()), message: message.into() }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// The complete output of one validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// True iff the batch may proceed to snapshot + apply.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|i| i.to_string()).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(|i| i.to_string()).collect()
    }

    /// Compact text summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "preflight {}: {} error(s), {} warning(s)",
            if self.is_valid() { "pass" } else { "fail" },
            self.errors.len(),
            self.warnings.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Destructive patterns
// ---------------------------------------------------------------------------

/// Constructs that must never appear in proposed content. Substring matches,
/// checked verbatim. SQL statements get their own per-line scan below.
pub const DESTRUCTIVE_PATTERNS: &[&str] = &[
    // process termination
    "std::process::exit",
    "std::process::abort",
    "process.exit(",
    // process / shell spawning
    "process::Command",
    "Command::new(",
    "child_process",
    "execSync(",
    // dynamic evaluation
    "eval(",
    // recursive force delete
    "rm -rf",
    "rm -fr",
];

/// Labels of every destructive construct found in `content`.
fn destructive_matches(content: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for pattern in DESTRUCTIVE_PATTERNS {
        if content.contains(pattern) {
            found.push((*pattern).to_string());
        }
    }
    // SQL scanned line by line so a WHERE clause on the same statement line
    // exonerates a DELETE
    for line in content.lines() {
        let upper = line.to_uppercase();
        for sql in ["DROP TABLE", "TRUNCATE TABLE"] {
            if upper.contains(sql) && !found.iter().any(|f| f == sql) {
                found.push(sql.to_string());
            }
        }
        if upper.contains("DELETE FROM") && !upper.contains("WHERE") {
            let label = "DELETE FROM without WHERE";
            if !found.iter().any(|f| f == label) {
                found.push(label.to_string());
            }
        }
    }
    found
}

const SOURCE_EXTENSIONS: &[&str] =
    &["rs", "ts", "tsx", "js", "jsx", "mjs", "c", "h", "cpp", "go", "java", "json"];

pub(crate) fn is_source_like(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Net brace/paren imbalance beyond `tolerance`, if any. String literals
/// throw the count off, so pre-flight treats this as a warning. The health
/// verifier reuses it post-apply as a hard structural check.
pub(crate) fn brace_imbalance(content: &str, tolerance: usize) -> Option<String> {
    let mut braces: i64 = 0;
    let mut parens: i64 = 0;
    for ch in content.chars() {
        match ch {
            '{' => braces += 1,
            '}' => braces -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            _ => {}
        }
    }
    let tol = tolerance as i64;
    if braces.abs() > tol {
        Some(format!("unbalanced braces (net {:+})", braces))
    } else if parens.abs() > tol {
        Some(format!("unbalanced parentheses (net {:+})", parens))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// PreflightValidator
// ---------------------------------------------------------------------------

/// The validation stage. Holds the policy guard, the limit set, and a
/// filesystem handle for existence probes.
pub struct PreflightValidator {
    guard: PolicyGuard,
    limits: LimitsConfig,
    fs: Arc<dyn ProjectFs>,
}

impl PreflightValidator {
    pub fn new(guard: PolicyGuard, limits: LimitsConfig, fs: Arc<dyn ProjectFs>) -> Self {
        Self { guard, limits, fs }
    }

    /// Run the full battery over `batch`.
    pub fn validate(&self, batch: &[ModificationRequest]) -> ValidationReport {
        let mut report = ValidationReport::default();

        if batch.is_empty() {
            report.errors.push(ValidationIssue::batch("empty batch: nothing to apply"));
        }
        if batch.len() > self.limits.max_batch_files {
            report.errors.push(ValidationIssue::batch(format!(
                "too many files: {} exceeds the batch cap of {}",
                batch.len(),
                self.limits.max_batch_files,
            )));
        }

        for req in batch {
            self.validate_entry(req, &mut report);
        }
        report
    }

    fn validate_entry(&self, req: &ModificationRequest, report: &mut ValidationReport) {
        let classified = self.guard.classify(&req.file_path);
        let writable = matches!(classified, Ok(PathClass::Allowed));
        match classified {
            Ok(PathClass::Allowed) => {}
            Ok(PathClass::Protected) => report
                .errors
                .push(ValidationIssue::file(&req.file_path, "protected path may not be modified")),
            Err(e) => report.errors.push(ValidationIssue::file(&req.file_path, e.to_string())),
        }

        match req.action {
            FileAction::Create | FileAction::Modify => {
                let Some(content) = &req.content else {
                    report.errors.push(ValidationIssue::file(
                        &req.file_path,
                        format!("{} requires content", req.action),
                    ));
                    return;
                };
                if content.len() > self.limits.max_file_bytes {
                    let err = PipelineError::SizeLimitExceeded {
                        path: req.file_path.clone(),
                        bytes: content.len(),
                        limit: self.limits.max_file_bytes,
                    };
                    report.errors.push(ValidationIssue::file(&req.file_path, err.to_string()));
                }
                for pattern in destructive_matches(content) {
                    let err = PipelineError::DangerousPattern {
                        path: req.file_path.clone(),
                        pattern,
                    };
                    report.errors.push(ValidationIssue::file(&req.file_path, err.to_string()));
                }
                if is_source_like(&req.file_path) {
                    if let Some(msg) = brace_imbalance(content, self.limits.brace_tolerance) {
                        report.warnings.push(ValidationIssue::file(&req.file_path, msg));
                    }
                }
            }
            FileAction::Delete => {
                if req.content.is_some() {
                    report.warnings.push(ValidationIssue::file(
                        &req.file_path,
                        "delete carries content; it will be ignored",
                    ));
                }
                if writable {
                    if let Ok(abs) = self.guard.absolute(&req.file_path) {
                        if !self.fs.exists(&abs) {
                            report.warnings.push(ValidationIssue::file(
                                &req.file_path,
                                "file does not exist; delete will be a no-op",
                            ));
                        }
                    }
                }
            }
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
    use rstest::rstest;

    fn validator() -> PreflightValidator {
        let fs = Arc::new(MemFs::new());
        fs.seed("/proj/src/existing.rs", b"fn old() {}\n");
        PreflightValidator::new(
            PolicyGuard::new(PolicyConfig::default(), "/proj"),
            LimitsConfig::default(),
            fs,
        )
    }

    fn ok_create(path: &str) -> ModificationRequest {
        ModificationRequest::create(path, "pub fn fresh() -> u32 { 7 }\n", "add fresh")
    }

    // -------------------------------------------------------------------
    // Batch-level rules
    // -------------------------------------------------------------------

    #[test]
    fn test_empty_batch_is_invalid() {
        let report = validator().validate(&[]);
        assert!(!report.is_valid());
    }

    #[test]
    fn test_clean_single_create_passes() {
        let report = validator().validate(&[ok_create("src/fresh.rs")]);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_batch_over_cap_names_too_many_files() {
        let batch: Vec<ModificationRequest> =
            (0..20).map(|i| ok_create(&format!("src/gen_{}.rs", i))).collect();
        let report = validator().validate(&batch);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.message.contains("too many files")));
    }

    #[test]
    fn test_batch_at_cap_passes() {
        let batch: Vec<ModificationRequest> =
            (0..15).map(|i| ok_create(&format!("src/gen_{}.rs", i))).collect();
        assert!(validator().validate(&batch).is_valid());
    }

    #[test]
    fn test_all_rules_evaluated_no_short_circuit() {
        // one oversized file + one protected path: both must be reported
        let big = "x".repeat(200 * 1024);
        let batch = vec![
            ModificationRequest::create("src/big.rs", big, "huge"),
            ModificationRequest::modify(".env", "SECRET=1", "tamper"),
        ];
        let report = validator().validate(&batch);
        assert!(report.errors.len() >= 2, "{:?}", report.errors);
    }

    // -------------------------------------------------------------------
    // Policy rules
    // -------------------------------------------------------------------

    #[test]
    fn test_protected_path_rejected_and_named() {
        let report = validator().validate(&[ModificationRequest::modify(
            "src/auth/session.rs",
            "pub fn weaken() {}",
            "bad",
        )]);
        assert!(!report.is_valid());
        let issue = &report.errors[0];
        assert_eq!(issue.path.as_deref(), Some("src/auth/session.rs"));
        assert!(issue.message.contains("protected"));
    }

    #[test]
    fn test_traversal_rejected() {
        let report = validator().validate(&[ok_create("../escape.rs")]);
        assert!(!report.is_valid());
        assert!(report.errors[0].message.contains("escapes the project root"));
    }

    #[test]
    fn test_out_of_scope_rejected() {
        let report = validator().validate(&[ok_create("README.md")]);
        assert!(!report.is_valid());
    }

    // -------------------------------------------------------------------
    // Content rules
    // -------------------------------------------------------------------

    #[test]
    fn test_oversized_content_rejected() {
        let big = "a".repeat(100 * 1024 + 1);
        let report =
            validator().validate(&[ModificationRequest::create("src/big.rs", big, "big")]);
        assert!(!report.is_valid());
        assert!(report.errors[0].message.contains("byte limit"));
    }

    #[test]
    fn test_content_at_limit_passes() {
        let exact = "b".repeat(100 * 1024);
        let report =
            validator().validate(&[ModificationRequest::create("src/big.rs", exact, "big")]);
        assert!(report.is_valid());
    }

    #[test]
    fn test_modify_without_content_is_error() {
        let req = ModificationRequest {
            file_path: "src/a.rs".into(),
            action: FileAction::Modify,
            content: None,
            description: "broken request".into(),
        };
        let report = validator().validate(&[req]);
        assert!(!report.is_valid());
        assert!(report.errors[0].message.contains("requires content"));
    }

    #[rstest]
    #[case("fn kill() { std::process::exit(1); }", "std::process::exit")]
    #[case("std::process::abort();", "std::process::abort")]
    #[case("use std::process::Command;", "process::Command")]
    #[case("let c = Command::new(\"sh\");", "Command::new(")]
    #[case("require('child_process')", "child_process")]
    #[case("execSync('ls')", "execSync(")]
    #[case("eval(userInput)", "eval(")]
    #[case("# cleanup\nrm -rf /tmp/cache", "rm -rf")]
    #[case("DROP TABLE snapshots;", "DROP TABLE")]
    #[case("truncate table logs;", "TRUNCATE TABLE")]
    #[case("DELETE FROM users;", "DELETE FROM without WHERE")]
    fn test_destructive_pattern_detected(#[case] content: &str, #[case] pattern: &str) {
        let report =
            validator().validate(&[ModificationRequest::create("src/evil.rs", content, "x")]);
        assert!(!report.is_valid());
        assert!(
            report.errors.iter().any(|e| e.message.contains(pattern)),
            "expected `{}` in {:?}",
            pattern,
            report.errors,
        );
    }

    #[test]
    fn test_delete_from_with_where_is_fine() {
        let report = validator().validate(&[ModificationRequest::create(
            "src/cleanup.rs",
            "// DELETE FROM sessions WHERE expired = 1",
            "scoped delete",
        )]);
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_evaluate_is_not_eval() {
        let report = validator().validate(&[ModificationRequest::create(
            "src/calc.rs",
            "let v = evaluate(expr);",
            "benign",
        )]);
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    // -------------------------------------------------------------------
    // Warnings
    // -------------------------------------------------------------------

    #[test]
    fn test_brace_imbalance_is_warning_not_error() {
        let report = validator().validate(&[ModificationRequest::create(
            "src/broken.rs",
            "fn f() { { { {\n", // four net opens, tolerance is 2
            "unbalanced",
        )]);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.message.contains("unbalanced braces")));
    }

    #[test]
    fn test_small_imbalance_within_tolerance_silent() {
        let report = validator().validate(&[ModificationRequest::create(
            "src/str.rs",
            "let s = \"{\";\nlet t = \"{\";\n", // net +2, tolerance 2
            "string braces",
        )]);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_brace_check_skipped_for_non_source() {
        let report = validator().validate(&[ModificationRequest::create(
            "docs/notes.md",
            "{{{{{{{{",
            "markdown braces",
        )]);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_delete_nonexistent_warns_but_valid() {
        let report =
            validator().validate(&[ModificationRequest::delete("src/ghost.rs", "remove ghost")]);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.message.contains("no-op")));
    }

    #[test]
    fn test_delete_existing_no_warning() {
        let report =
            validator().validate(&[ModificationRequest::delete("src/existing.rs", "remove")]);
        assert!(report.is_valid());
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_summary_counts() {
        let report = validator().validate(&[ModificationRequest::modify(".env", "X=1", "bad")]);
        assert!(report.summary().contains("fail"));
        assert!(report.summary().contains("1 error(s)"));
    }
}
