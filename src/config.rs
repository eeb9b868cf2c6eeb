//! # Module: Pipeline Configuration
//!
//! ## Responsibility
//! Every tunable of the pipeline in one place: policy lists, batch limits,
//! verifier commands and timeouts, job retention, store location. Components
//! receive these values by injection; nothing in the pipeline consults a
//! hard-coded path list or an ambient global.
//!
//! ## Usage
//! ```rust,ignore
//! let cfg = PipelineConfig::load("selfpatch.toml")?;
//! let guard = PolicyGuard::new(cfg.policy.clone(), &cfg.project_root);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// PolicyConfig
// ---------------------------------------------------------------------------

/// Deny / allow lists for the policy guard, as root-relative path prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Paths (files or directory prefixes) that must never be written,
    /// regardless of caller privilege.
    pub protected_paths: Vec<String>,
    /// Directory prefixes mutations are allowed to touch. Anything inside
    /// the root but outside these is rejected as out of scope.
    pub allowed_roots: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protected_paths: vec![
                // authentication / encryption layer
                "src/auth".into(),
                "src/crypto".into(),
                // the pipeline's own implementation, dir or single-file layout
                "src/safety".into(),
                "src/safety.rs".into(),
                // schema + migrations
                "migrations".into(),
                "schema.sql".into(),
                // environment / secrets
                ".env".into(),
                "secrets".into(),
                // fault-tolerance kill-switch
                "src/killswitch.rs".into(),
                // pipeline state (snapshots, audit log, restart sentinel)
                ".selfpatch".into(),
            ],
            allowed_roots: vec!["src".into(), "tests".into(), "docs".into()],
        }
    }
}

// ---------------------------------------------------------------------------
// LimitsConfig
// ---------------------------------------------------------------------------

/// Hard caps applied during pre-flight validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of file operations in one batch.
    pub max_batch_files: usize,
    /// Maximum content size for a single create/modify, in bytes.
    pub max_file_bytes: usize,
    /// Brace/paren imbalance tolerated before the syntax heuristic warns.
    /// String literals produce false positives, so this is never zero in
    /// production.
    pub brace_tolerance: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_batch_files: 15,
            max_file_bytes: 100 * 1024,
            brace_tolerance: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// VerifierConfig
// ---------------------------------------------------------------------------

/// What the post-apply health verifier runs, and for how long.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Run the type-check step after apply.
    pub run_type_check: bool,
    /// Run the test-suite step after apply.
    pub run_tests: bool,
    /// Override for the type-check command (default: `cargo check --all-targets`).
    pub type_check_command: Option<String>,
    /// Override for the test command (default: `cargo test --quiet`).
    pub test_command: Option<String>,
    /// Hard wall-clock limit per external check. Expiry counts as a failed
    /// check, not a crash.
    pub check_timeout_secs: u64,
    /// Files whose absence means the tree is structurally broken.
    pub critical_files: Vec<String>,
    /// The host project's pipeline entry point; its disappearance fails the
    /// self-protection check.
    pub pipeline_source: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            run_type_check: true,
            run_tests: true,
            type_check_command: None,
            test_command: None,
            check_timeout_secs: 120,
            critical_files: vec!["Cargo.toml".into(), "src/main.rs".into()],
            pipeline_source: "src/safety.rs".into(),
        }
    }
}

impl VerifierConfig {
    pub fn type_check_command(&self) -> &str {
        self.type_check_command.as_deref().unwrap_or("cargo check --all-targets")
    }

    pub fn test_command(&self) -> &str {
        self.test_command.as_deref().unwrap_or("cargo test --quiet")
    }
}

// ---------------------------------------------------------------------------
// JobsConfig
// ---------------------------------------------------------------------------

/// Background-job bookkeeping knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// How long a finished job record stays queryable before it is swept.
    pub retention_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { retention_secs: 300 }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Root configuration object for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Project root all mutations are confined to.
    pub project_root: PathBuf,
    /// SQLite database location, resolved against the project root unless
    /// absolute.
    pub database_path: PathBuf,
    /// Shared secret required for write operations. `None` leaves writes
    /// open, for single-user development setups. Usually supplied through
    /// `SELFPATCH_ADMIN_TOKEN` rather than the config file.
    pub admin_token: Option<String>,
    pub policy: PolicyConfig,
    pub limits: LimitsConfig,
    pub verifier: VerifierConfig,
    pub jobs: JobsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            database_path: PathBuf::from(".selfpatch/pipeline.db"),
            admin_token: None,
            policy: PolicyConfig::default(),
            limits: LimitsConfig::default(),
            verifier: VerifierConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { project_root: root.into(), ..Self::default() }
    }

    /// Fill the admin token from `SELFPATCH_ADMIN_TOKEN` when the config
    /// file left it unset.
    pub fn admin_token_from_env(mut self) -> Self {
        if self.admin_token.is_none() {
            self.admin_token = std::env::var("SELFPATCH_ADMIN_TOKEN").ok();
        }
        self
    }

    /// Parse a TOML config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: PipelineConfig =
            toml::from_str(&raw).map_err(|e| PipelineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Sanity bounds. Zero caps would make every batch unprocessable, which
    /// is a configuration mistake rather than a policy.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_batch_files == 0 {
            return Err(PipelineError::Config("limits.max_batch_files must be >= 1".into()));
        }
        if self.limits.max_file_bytes == 0 {
            return Err(PipelineError::Config("limits.max_file_bytes must be >= 1".into()));
        }
        if self.verifier.check_timeout_secs == 0 {
            return Err(PipelineError::Config("verifier.check_timeout_secs must be >= 1".into()));
        }
        if self.policy.allowed_roots.is_empty() {
            return Err(PipelineError::Config("policy.allowed_roots must not be empty".into()));
        }
        Ok(())
    }

    /// Absolute database path.
    pub fn database_path(&self) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            self.project_root.join(&self.database_path)
        }
    }

    /// Sentinel file a supervisor polls for restart requests.
    pub fn restart_sentinel_path(&self) -> PathBuf {
        self.project_root.join(".selfpatch").join("restart-requested")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_match_production_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.limits.max_batch_files, 15);
        assert_eq!(cfg.limits.max_file_bytes, 100 * 1024);
    }

    #[test]
    fn test_default_policy_protects_own_state_dir() {
        let cfg = PipelineConfig::default();
        assert!(cfg.policy.protected_paths.iter().any(|p| p == ".selfpatch"));
    }

    #[test]
    fn test_default_policy_protects_env_and_migrations() {
        let p = PolicyConfig::default();
        assert!(p.protected_paths.iter().any(|x| x == ".env"));
        assert!(p.protected_paths.iter().any(|x| x == "migrations"));
    }

    #[test]
    fn test_verifier_command_defaults() {
        let v = VerifierConfig::default();
        assert_eq!(v.type_check_command(), "cargo check --all-targets");
        assert_eq!(v.test_command(), "cargo test --quiet");
    }

    #[test]
    fn test_verifier_command_override_wins() {
        let v = VerifierConfig {
            test_command: Some("npm test".into()),
            ..VerifierConfig::default()
        };
        assert_eq!(v.test_command(), "npm test");
    }

    #[test]
    fn test_validate_rejects_zero_batch_cap() {
        let mut cfg = PipelineConfig::default();
        cfg.limits.max_batch_files = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_allowed_roots() {
        let mut cfg = PipelineConfig::default();
        cfg.policy.allowed_roots.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_database_path_resolves_relative_to_root() {
        let cfg = PipelineConfig::with_root("/srv/app");
        assert_eq!(cfg.database_path(), PathBuf::from("/srv/app/.selfpatch/pipeline.db"));
    }

    #[test]
    fn test_database_path_absolute_untouched() {
        let mut cfg = PipelineConfig::with_root("/srv/app");
        cfg.database_path = PathBuf::from("/var/lib/selfpatch.db");
        assert_eq!(cfg.database_path(), PathBuf::from("/var/lib/selfpatch.db"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            project_root = "/srv/app"

            [limits]
            max_batch_files = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.project_root, PathBuf::from("/srv/app"));
        assert_eq!(cfg.limits.max_batch_files, 5);
        // untouched sections keep production defaults
        assert_eq!(cfg.limits.max_file_bytes, 100 * 1024);
        assert!(cfg.verifier.run_tests);
        assert_eq!(cfg.jobs.retention_secs, 300);
    }

    #[test]
    fn test_full_roundtrip_through_toml() {
        let cfg = PipelineConfig::with_root("/srv/app");
        let serialized = toml::to_string(&cfg).unwrap();
        let back: PipelineConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back.project_root, cfg.project_root);
        assert_eq!(back.limits.max_batch_files, cfg.limits.max_batch_files);
    }
}
