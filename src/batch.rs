//! # Module: Mutation Batch
//!
//! ## Responsibility
//! The data model a caller submits: an ordered list of file operations that
//! succeed or fail as one unit. Requests are transient values; only their
//! audit trail is persisted.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FileAction
// ---------------------------------------------------------------------------

/// What to do with one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FileAction {
    /// Create and modify carry content; delete must not.
    pub fn requires_content(&self) -> bool {
        matches!(self, FileAction::Create | FileAction::Modify)
    }
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAction::Create => write!(f, "create"),
            FileAction::Modify => write!(f, "modify"),
            FileAction::Delete => write!(f, "delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// ModificationRequest
// ---------------------------------------------------------------------------

/// One proposed file operation within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRequest {
    /// Root-relative path of the target file.
    pub file_path: String,
    pub action: FileAction,
    /// Full post-change content for create/modify; `None` for delete.
    #[serde(default)]
    pub content: Option<String>,
    /// Human-readable reason, carried into the audit log.
    pub description: String,
}

impl ModificationRequest {
    pub fn create(
        path: impl Into<String>,
        content: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            file_path: path.into(),
            action: FileAction::Create,
            content: Some(content.into()),
            description: description.into(),
        }
    }

    pub fn modify(
        path: impl Into<String>,
        content: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            file_path: path.into(),
            action: FileAction::Modify,
            content: Some(content.into()),
            description: description.into(),
        }
    }

    pub fn delete(path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            file_path: path.into(),
            action: FileAction::Delete,
            content: None,
            description: description.into(),
        }
    }

    pub fn content_bytes(&self) -> usize {
        self.content.as_ref().map(|c| c.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
