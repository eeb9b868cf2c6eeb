//! # Stage: Policy Guard
//!
//! ## Responsibility
//! Decide, for one candidate path, whether the pipeline may write it. Three
//! outcomes: `Allowed`, `Protected` (readable but never writable), or an
//! error (`PathTraversal` for escapes, `OutOfScope` for paths under no
//! modifiable root).
//!
//! Classification is purely lexical. Paths are normalized component by
//! component (`.` dropped, `..` popped) without touching the filesystem, so
//! a path that does not exist yet is classified exactly like one that does.
//! Anything that cannot be proven to stay inside the project root is
//! rejected.
//!
//! ## Guarantees
//! - Fail closed: empty, escaping, and root-identical paths are all errors.
//! - Prefix matches are component-wise, so `src/authx.rs` does not match a
//!   protected `src/auth`.
//! - No side effects. Safe to call any number of times.
//!
//! ## NOT Responsible For
//! - Content inspection (pre-flight validator)
//! - Privilege checks (service layer)

use std::path::{Component, Path, PathBuf};

use crate::config::PolicyConfig;
use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// PathClass
// ---------------------------------------------------------------------------

/// Verdict for a path that stayed inside the project root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Under a modifiable source root; writes may proceed to validation.
    Allowed,
    /// On the deny list. Reads are fine, writes never are.
    Protected,
}

// ---------------------------------------------------------------------------
// PolicyGuard
// ---------------------------------------------------------------------------

/// Path classifier for the mutation pipeline. Lists come from configuration;
/// nothing here is baked in.
#[derive(Debug, Clone)]
pub struct PolicyGuard {
    config: PolicyConfig,
    root: PathBuf,
}

impl PolicyGuard {
    pub fn new(config: PolicyConfig, root: impl Into<PathBuf>) -> Self {
        let raw = root.into();
        let root = normalize(&raw).unwrap_or(raw);
        Self { config, root }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalized root-relative form of `raw`, or `PathTraversal` if the
    /// path cannot be proven to stay inside the project root.
    pub fn relative(&self, raw: &str) -> Result<PathBuf> {
        if raw.trim().is_empty() {
            return Err(PipelineError::PathTraversal { path: raw.to_string() });
        }
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined)
            .ok_or_else(|| PipelineError::PathTraversal { path: raw.to_string() })?;
        match normalized.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => Ok(rel.to_path_buf()),
            _ => Err(PipelineError::PathTraversal { path: raw.to_string() }),
        }
    }

    /// Absolute on-disk location for `raw`, traversal-checked.
    pub fn absolute(&self, raw: &str) -> Result<PathBuf> {
        Ok(self.root.join(self.relative(raw)?))
    }

    /// Classify one path. Protected beats allowed when both match.
    pub fn classify(&self, raw: &str) -> Result<PathClass> {
        let rel = self.relative(raw)?;
        if matches_any(&rel, &self.config.protected_paths) {
            return Ok(PathClass::Protected);
        }
        if matches_any(&rel, &self.config.allowed_roots) {
            return Ok(PathClass::Allowed);
        }
        Err(PipelineError::OutOfScope { path: raw.to_string() })
    }

    /// Convenience for callers that only need a write/no-write answer as an
    /// error. Protected paths surface as `PolicyViolation`.
    pub fn check_writable(&self, raw: &str) -> Result<PathBuf> {
        match self.classify(raw)? {
            PathClass::Allowed => self.relative(raw),
            PathClass::Protected => Err(PipelineError::PolicyViolation { path: raw.to_string() }),
        }
    }

    /// Read-path rule: only the allow-listed-directory test applies, so a
    /// protected file under an allowed root stays readable while deny-listed
    /// files outside every allowed root (secrets, migrations) do not.
    pub fn check_readable(&self, raw: &str) -> Result<PathBuf> {
        let rel = self.relative(raw)?;
        if matches_any(&rel, &self.config.allowed_roots) {
            return Ok(rel);
        }
        Err(PipelineError::OutOfScope { path: raw.to_string() })
    }
}

/// Component-wise prefix test. Equality counts as a match.
fn matches_any(rel: &Path, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| rel.starts_with(Path::new(p)))
}

/// Lexical normalization: drop `.`, resolve `..` by popping. Returns `None`
/// when a `..` would climb past the start of the path.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
