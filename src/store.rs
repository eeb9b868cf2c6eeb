//! # Stage: Snapshot Store
//!
//! ## Responsibility
//! Durable memory of the pipeline: snapshot metadata, captured file content,
//! and the append-only modification log, all in one SQLite database (WAL
//! mode). Snapshot capture runs in a single transaction so a half-captured
//! snapshot can never exist.
//!
//! A captured path that did not exist on disk is stored as an absence marker
//! (`content` and `content_hash` both NULL). Rolling back later removes such
//! files, restoring byte-identical pre-batch state even for creates.
//!
//! ## Guarantees
//! - `snapshot_files` rows are immutable once written.
//! - `modification_log` is append-only; rollback adds entries, never edits.
//! - `file_count` counts content-bearing rows only, so a pure-create batch
//!   reports zero captured files.
//!
//! ## NOT Responsible For
//! - Touching the live tree (applier / rollback controller)
//! - Deciding what to capture (orchestrator)
//!
//! ## Usage
//! ```rust,ignore
//! let store = PipelineStore::open(&cfg.database_path())?;
//! let captured = capture_files(fs.as_ref(), &targets)?;
//! let snap = store.create_snapshot(&captured, "batch apply", "agent")?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::fsio::ProjectFs;

// ---------------------------------------------------------------------------
// Time + hashing helpers
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Snapshot / SnapshotFile
// ---------------------------------------------------------------------------

/// Lifecycle state of a snapshot row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Active,
    RolledBack,
}

impl SnapshotStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Active => "active",
            SnapshotStatus::RolledBack => "rolled_back",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "rolled_back" => SnapshotStatus::RolledBack,
            _ => SnapshotStatus::Active,
        }
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One point-in-time recovery anchor.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: i64,
    pub reason: String,
    pub triggered_by: String,
    /// Content-bearing captured files. Absence markers are not counted.
    pub file_count: i64,
    pub status: SnapshotStatus,
    /// Set only after a post-apply health pass over this snapshot's batch.
    pub known_good: bool,
    pub created_at_ms: i64,
}

/// One captured file within a snapshot. `content == None` marks a path that
/// did not exist at capture time.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub snapshot_id: i64,
    /// Root-relative path.
    pub file_path: String,
    pub content: Option<Vec<u8>>,
    pub content_hash: Option<String>,
}

impl SnapshotFile {
    pub fn is_absence_marker(&self) -> bool {
        self.content.is_none()
    }
}

/// Pre-insert form of a captured file, produced by `capture_files`.
#[derive(Debug, Clone)]
pub struct CapturedFile {
    pub path: String,
    pub content: Option<Vec<u8>>,
}

/// Read the pre-batch state of every target. `targets` pairs the
/// root-relative path with its absolute location; a missing file becomes an
/// absence marker. Duplicate paths keep the first capture, which is the true
/// pre-batch state.
pub fn capture_files(
    fs: &dyn ProjectFs,
    targets: &[(String, PathBuf)],
) -> Result<Vec<CapturedFile>> {
    let mut seen: Vec<&str> = Vec::new();
    let mut out = Vec::with_capacity(targets.len());
    for (rel, abs) in targets {
        if seen.iter().any(|s| *s == rel.as_str()) {
            continue;
        }
        seen.push(rel);
        let content = if fs.exists(abs) { Some(fs.read(abs)?) } else { None };
        out.push(CapturedFile { path: rel.clone(), content });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// ModificationLogEntry
// ---------------------------------------------------------------------------

/// One persisted audit row. Exactly one per attempted file operation, plus
/// synthetic rollback markers.
#[derive(Debug, Clone, Serialize)]
pub struct ModificationLogEntry {
    pub id: i64,
    pub snapshot_id: Option<i64>,
    pub requested_by: String,
    pub user_id: Option<String>,
    pub action: String,
    pub target_file: String,
    pub description: String,
    pub validation_result: String,
    pub applied: bool,
    pub rolled_back: bool,
    pub error_message: Option<String>,
    pub created_at_ms: i64,
}

/// Insert form of a log row.
#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub snapshot_id: Option<i64>,
    pub requested_by: String,
    pub user_id: Option<String>,
    pub action: String,
    pub target_file: String,
    pub description: String,
    pub validation_result: String,
    pub applied: bool,
    pub rolled_back: bool,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// PipelineStore
// ---------------------------------------------------------------------------

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    reason        TEXT NOT NULL,
    triggered_by  TEXT NOT NULL,
    file_count    INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL DEFAULT 'active',
    known_good    INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id   INTEGER NOT NULL REFERENCES snapshots(id),
    file_path     TEXT NOT NULL,
    content       BLOB,
    content_hash  TEXT,
    UNIQUE (snapshot_id, file_path)
);

CREATE TABLE IF NOT EXISTS modification_log (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id       INTEGER,
    requested_by      TEXT NOT NULL,
    user_id           TEXT,
    action            TEXT NOT NULL,
    target_file       TEXT NOT NULL,
    description       TEXT NOT NULL,
    validation_result TEXT NOT NULL,
    applied           INTEGER NOT NULL DEFAULT 0,
    rolled_back       INTEGER NOT NULL DEFAULT 0,
    error_message     TEXT,
    created_at_ms     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_files_snapshot ON snapshot_files (snapshot_id);
CREATE INDEX IF NOT EXISTS idx_modification_log_snapshot ON modification_log (snapshot_id);
"#;

/// SQLite-backed store shared by every pipeline stage. The connection sits
/// behind a mutex; no stage holds it across an await point.
pub struct PipelineStore {
    conn: Mutex<Connection>,
}

impl PipelineStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| PipelineError::StoreUnavailable { reason: e.to_string() })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| PipelineError::StoreUnavailable { reason: e.to_string() })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| PipelineError::StoreUnavailable { reason: e.to_string() })?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Ephemeral store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::StoreUnavailable { reason: e.to_string() })?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(MIGRATIONS)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::StoreUnavailable { reason: "connection lock poisoned".into() })
    }

    /// Liveness probe used by the health verifier and the fail-closed gate.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| PipelineError::StoreUnavailable { reason: e.to_string() })?;
        Ok(())
    }

    // -- snapshots ----------------------------------------------------------

    /// Persist one snapshot plus all captured rows in a single transaction.
    pub fn create_snapshot(
        &self,
        files: &[CapturedFile],
        reason: &str,
        triggered_by: &str,
    ) -> Result<Snapshot> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at_ms = now_ms();
        let file_count = files.iter().filter(|f| f.content.is_some()).count() as i64;
        tx.execute(
            "INSERT INTO snapshots (reason, triggered_by, file_count, status, known_good, created_at_ms)
             VALUES (?1, ?2, ?3, 'active', 0, ?4)",
            params![reason, triggered_by, file_count, created_at_ms],
        )?;
        let id = tx.last_insert_rowid();
        for f in files {
            let hash = f.content.as_deref().map(content_hash);
            tx.execute(
                "INSERT INTO snapshot_files (snapshot_id, file_path, content, content_hash)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, f.path, f.content, hash],
            )?;
        }
        tx.commit()?;
        Ok(Snapshot {
            id,
            reason: reason.to_string(),
            triggered_by: triggered_by.to_string(),
            file_count,
            status: SnapshotStatus::Active,
            known_good: false,
            created_at_ms,
        })
    }

    pub fn snapshot(&self, id: i64) -> Result<Snapshot> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, reason, triggered_by, file_count, status, known_good, created_at_ms
             FROM snapshots WHERE id = ?1",
            params![id],
            snapshot_from_row,
        )
        .optional()?
        .ok_or(PipelineError::SnapshotNotFound(id))
    }

    pub fn snapshot_files(&self, id: i64) -> Result<Vec<SnapshotFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, file_path, content, content_hash
             FROM snapshot_files WHERE snapshot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(SnapshotFile {
                snapshot_id: row.get(0)?,
                file_path: row.get(1)?,
                content: row.get(2)?,
                content_hash: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent snapshot that passed verification. A prior rollback does
    /// not disqualify it: the captured rows are immutable, so the snapshot
    /// stays restorable and the recovery anchor survives repeated use. Ties
    /// on the millisecond clock break toward the higher id.
    pub fn latest_known_good(&self) -> Result<Option<Snapshot>> {
        let conn = self.conn()?;
        let snap = conn
            .query_row(
                "SELECT id, reason, triggered_by, file_count, status, known_good, created_at_ms
                 FROM snapshots WHERE known_good = 1
                 ORDER BY created_at_ms DESC, id DESC LIMIT 1",
                [],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snap)
    }

    pub fn list_snapshots(&self, limit: usize) -> Result<Vec<Snapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, reason, triggered_by, file_count, status, known_good, created_at_ms
             FROM snapshots ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], snapshot_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_known_good(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute("UPDATE snapshots SET known_good = 1 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(PipelineError::SnapshotNotFound(id));
        }
        Ok(())
    }

    pub fn mark_rolled_back(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE snapshots SET status = 'rolled_back' WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(PipelineError::SnapshotNotFound(id));
        }
        Ok(())
    }

    // -- modification log ---------------------------------------------------

    pub fn record_log(&self, entry: &NewLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO modification_log
             (snapshot_id, requested_by, user_id, action, target_file, description,
              validation_result, applied, rolled_back, error_message, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.snapshot_id,
                entry.requested_by,
                entry.user_id,
                entry.action,
                entry.target_file,
                entry.description,
                entry.validation_result,
                entry.applied as i64,
                entry.rolled_back as i64,
                entry.error_message,
                now_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest entries first.
    pub fn history(&self, limit: usize) -> Result<Vec<ModificationLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, snapshot_id, requested_by, user_id, action, target_file, description,
                    validation_result, applied, rolled_back, error_message, created_at_ms
             FROM modification_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ModificationLogEntry {
                id: row.get(0)?,
                snapshot_id: row.get(1)?,
                requested_by: row.get(2)?,
                user_id: row.get(3)?,
                action: row.get(4)?,
                target_file: row.get(5)?,
                description: row.get(6)?,
                validation_result: row.get(7)?,
                applied: row.get::<_, i64>(8)? != 0,
                rolled_back: row.get::<_, i64>(9)? != 0,
                error_message: row.get(10)?,
                created_at_ms: row.get(11)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let status: String = row.get(4)?;
    Ok(Snapshot {
        id: row.get(0)?,
        reason: row.get(1)?,
        triggered_by: row.get(2)?,
        file_count: row.get(3)?,
        status: SnapshotStatus::parse(&status),
        known_good: row.get::<_, i64>(5)? != 0,
        created_at_ms: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
