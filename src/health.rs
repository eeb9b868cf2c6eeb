//! # Stage: Health Verification
//!
//! ## Responsibility
//! The sole gate between "files written" and "batch accepted". Runs a fixed
//! structural battery against the live tree, then (unless skipped) two
//! external steps through the `ExternalCheck` strategy:
//!
//! 1. Critical files present
//! 2. Gross brace balance on critical source files
//! 3. Persistent store reachable
//! 4. Self-protection: the host pipeline entry point still exists
//! 5. Type check (external, hard timeout)
//! 6. Test suite (external, hard timeout, output parsed for counts)
//!
//! ## Guarantees
//! - A timed-out external check is a failed check, never a crash.
//! - `healthy` is the AND of every non-skipped check.
//! - Read-only with respect to the tree.
//!
//! ## NOT Responsible For
//! - Acting on an unhealthy verdict (orchestrator + rollback controller)

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::VerifierConfig;
use crate::fsio::ProjectFs;
use crate::store::PipelineStore;
use crate::validator::{brace_imbalance, is_source_like};

/// Imbalance tolerated by the structural brace check. Looser than exact
/// balance because string literals skew the count.
const STRUCTURAL_BRACE_TOLERANCE: usize = 2;

// ---------------------------------------------------------------------------
// HealthCheckResult / HealthReport
// ---------------------------------------------------------------------------

/// The outcome of one named health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: false,
            message: message.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            passed: false,
            skipped: false,
            message: message.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn skip(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: true,
            message: reason.into(),
            duration_ms: 0,
        }
    }
}

impl std::fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            write!(f, "{}: SKIP ({})", self.name, self.message)
        } else if self.passed {
            write!(f, "{}: PASS", self.name)
        } else {
            write!(f, "{}: FAIL ({})", self.name, self.message)
        }
    }
}

/// The complete output of one verification run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<HealthCheckResult>,
}

impl HealthReport {
    pub fn failed_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.skipped && !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Compact text summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "health {}: {}/{} checks passed",
            if self.healthy { "ok" } else { "DEGRADED" },
            self.checks.iter().filter(|c| !c.skipped && c.passed).count(),
            self.checks.iter().filter(|c| !c.skipped).count(),
        )
    }
}

/// Caller-selectable scope for a verification run. Defaults run everything.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HealthCheckOptions {
    pub skip_type_check: bool,
    pub skip_tests: bool,
}

impl HealthCheckOptions {
    /// Structural checks only; no subprocesses.
    pub fn structural_only() -> Self {
        Self { skip_type_check: true, skip_tests: true }
    }
}

// ---------------------------------------------------------------------------
// ExternalCheck strategy
// ---------------------------------------------------------------------------

/// Which external step is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    TypeCheck,
    TestSuite,
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::TypeCheck => "type_check",
            CheckKind::TestSuite => "tests",
        }
    }
}

/// Abstracts subprocess execution so the verifier's logic is testable
/// without spawning anything.
#[async_trait::async_trait]
pub trait ExternalCheck: Send + Sync {
    async fn run(&self, kind: CheckKind, command: &str, timeout: Duration) -> HealthCheckResult;
}

// ---------------------------------------------------------------------------
// CommandCheck — production ExternalCheck
// ---------------------------------------------------------------------------

/// Runs the configured command as a subprocess in the project root, bounded
/// by a hard timeout.
pub struct CommandCheck {
    workdir: PathBuf,
}

impl CommandCheck {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }
}

#[async_trait::async_trait]
impl ExternalCheck for CommandCheck {
    async fn run(&self, kind: CheckKind, command: &str, timeout: Duration) -> HealthCheckResult {
        let start = Instant::now();
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return HealthCheckResult::fail(kind.name(), "empty command", start.elapsed());
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(target: "selfpatch::health", kind = kind.name(), command, "Running external check");
        match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => HealthCheckResult::fail(
                kind.name(),
                format!("timed out after {}s", timeout.as_secs()),
                start.elapsed(),
            ),
            Ok(Err(e)) => HealthCheckResult::fail(
                kind.name(),
                format!("could not run `{}`: {}", command, e),
                start.elapsed(),
            ),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let counts = parse_test_summary(&stdout);
                if output.status.success() {
                    let message = match (kind, counts) {
                        (CheckKind::TestSuite, Some((p, f))) => {
                            format!("{} passed, {} failed", p, f)
                        }
                        _ => "ok".to_string(),
                    };
                    HealthCheckResult::pass(kind.name(), message, start.elapsed())
                } else {
                    let message = match (kind, counts) {
                        (CheckKind::TestSuite, Some((p, f))) => {
                            format!("{} passed, {} failed", p, f)
                        }
                        _ => tail_snippet(if stderr.trim().is_empty() { &stdout } else { &stderr }, 6),
                    };
                    HealthCheckResult::fail(kind.name(), message, start.elapsed())
                }
            }
        }
    }
}

/// Sum the pass/fail counts from every `test result:` line (cargo prints one
/// per test target).
fn parse_test_summary(output: &str) -> Option<(u64, u64)> {
    let mut found = false;
    let (mut passed, mut failed) = (0u64, 0u64);
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("test result:") {
            continue;
        }
        if let (Some(p), Some(f)) = (extract_count(line, "passed"), extract_count(line, "failed")) {
            found = true;
            passed += p;
            failed += f;
        }
    }
    found.then_some((passed, failed))
}

fn extract_count(line: &str, label: &str) -> Option<u64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for i in 1..tokens.len() {
        if tokens[i].trim_end_matches([';', '.']) == label {
            return tokens[i - 1].parse().ok();
        }
    }
    None
}

/// Last few non-empty lines of subprocess output, for failure messages.
fn tail_snippet(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

// ---------------------------------------------------------------------------
// ScriptedCheck — deterministic ExternalCheck for tests
// ---------------------------------------------------------------------------

/// An `ExternalCheck` with pre-decided outcomes per kind.
#[derive(Debug, Default)]
pub struct ScriptedCheck {
    type_check_failure: Option<String>,
    test_failure: Option<String>,
}

impl ScriptedCheck {
    pub fn all_pass() -> Self {
        Self::default()
    }

    pub fn with_type_check_failure(mut self, reason: impl Into<String>) -> Self {
        self.type_check_failure = Some(reason.into());
        self
    }

    pub fn with_test_failure(mut self, reason: impl Into<String>) -> Self {
        self.test_failure = Some(reason.into());
        self
    }
}

#[async_trait::async_trait]
impl ExternalCheck for ScriptedCheck {
    async fn run(&self, kind: CheckKind, _command: &str, _timeout: Duration) -> HealthCheckResult {
        let scripted = match kind {
            CheckKind::TypeCheck => &self.type_check_failure,
            CheckKind::TestSuite => &self.test_failure,
        };
        match scripted {
            None => HealthCheckResult::pass(kind.name(), "ok", Duration::from_millis(5)),
            Some(reason) => {
                HealthCheckResult::fail(kind.name(), reason.clone(), Duration::from_millis(5))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HealthVerifier
// ---------------------------------------------------------------------------

/// The verification stage.
pub struct HealthVerifier {
    config: VerifierConfig,
    root: PathBuf,
    fs: Arc<dyn ProjectFs>,
    store: Arc<PipelineStore>,
    external: Arc<dyn ExternalCheck>,
}

impl HealthVerifier {
    pub fn new(
        config: VerifierConfig,
        root: impl Into<PathBuf>,
        fs: Arc<dyn ProjectFs>,
        store: Arc<PipelineStore>,
        external: Arc<dyn ExternalCheck>,
    ) -> Self {
        Self { config, root: root.into(), fs, store, external }
    }

    /// Run the full battery under `options`.
    pub async fn run(&self, options: &HealthCheckOptions) -> HealthReport {
        let mut checks = vec![
            self.check_critical_files(),
            self.check_brace_balance(),
            self.check_store(),
            self.check_self_protection(),
        ];

        let timeout = Duration::from_secs(self.config.check_timeout_secs);
        if options.skip_type_check {
            checks.push(HealthCheckResult::skip("type_check", "skipped by request"));
        } else if !self.config.run_type_check {
            checks.push(HealthCheckResult::skip("type_check", "disabled in config"));
        } else {
            checks.push(
                self.external
                    .run(CheckKind::TypeCheck, self.config.type_check_command(), timeout)
                    .await,
            );
        }
        if options.skip_tests {
            checks.push(HealthCheckResult::skip("tests", "skipped by request"));
        } else if !self.config.run_tests {
            checks.push(HealthCheckResult::skip("tests", "disabled in config"));
        } else {
            checks.push(
                self.external
                    .run(CheckKind::TestSuite, self.config.test_command(), timeout)
                    .await,
            );
        }

        let healthy = checks.iter().filter(|c| !c.skipped).all(|c| c.passed);
        tracing::info!(
            target: "selfpatch::health",
            healthy,
            checks = checks.len(),
            "Health verification complete"
        );
        HealthReport { healthy, checks }
    }

    fn check_critical_files(&self) -> HealthCheckResult {
        let start = Instant::now();
        let missing: Vec<&str> = self
            .config
            .critical_files
            .iter()
            .map(String::as_str)
            .filter(|f| !self.fs.exists(&self.root.join(f)))
            .collect();
        if missing.is_empty() {
            HealthCheckResult::pass("critical_files", "all present", start.elapsed())
        } else {
            HealthCheckResult::fail(
                "critical_files",
                format!("missing: {}", missing.join(", ")),
                start.elapsed(),
            )
        }
    }

    fn check_brace_balance(&self) -> HealthCheckResult {
        let start = Instant::now();
        let mut broken: Vec<String> = Vec::new();
        for file in &self.config.critical_files {
            if !is_source_like(file) {
                continue;
            }
            let abs = self.root.join(file);
            if !self.fs.exists(&abs) {
                // absence is the critical_files check's finding
                continue;
            }
            match self.fs.read_string(&abs) {
                Ok(content) => {
                    if let Some(msg) = brace_imbalance(&content, STRUCTURAL_BRACE_TOLERANCE) {
                        broken.push(format!("{}: {}", file, msg));
                    }
                }
                Err(e) => broken.push(format!("{}: unreadable ({})", file, e)),
            }
        }
        if broken.is_empty() {
            HealthCheckResult::pass("structure", "balanced", start.elapsed())
        } else {
            HealthCheckResult::fail("structure", broken.join("; "), start.elapsed())
        }
    }

    fn check_store(&self) -> HealthCheckResult {
        let start = Instant::now();
        match self.store.ping() {
            Ok(()) => HealthCheckResult::pass("store", "reachable", start.elapsed()),
            Err(e) => HealthCheckResult::fail("store", e.to_string(), start.elapsed()),
        }
    }

    fn check_self_protection(&self) -> HealthCheckResult {
        let start = Instant::now();
        let abs = self.root.join(&self.config.pipeline_source);
        if self.fs.exists(&abs) {
            HealthCheckResult::pass("self_protection", "pipeline source intact", start.elapsed())
        } else {
            HealthCheckResult::fail(
                "self_protection",
                format!("{} is gone", self.config.pipeline_source),
                start.elapsed(),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
