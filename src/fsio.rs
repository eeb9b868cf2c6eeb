//! # Module: Filesystem Port
//!
//! ## Responsibility
//! The one seam between the pipeline and the disk. Applier, rollback and
//! verifier talk to a `ProjectFs` trait object instead of `std::fs`, so unit
//! tests can run against an in-memory tree and fault injection does not need
//! a real filesystem.
//!
//! Paths given to this layer are absolute and already policy-checked. No
//! classification happens here.
//!
//! ## Guarantees
//! - `write` creates missing parent directories.
//! - `list_dir` output is name-sorted for stable rendering.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// DirEntryInfo
// ---------------------------------------------------------------------------

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    /// File size in bytes; zero for directories.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// ProjectFs
// ---------------------------------------------------------------------------

/// Filesystem operations the pipeline needs. Implementations must be safe to
/// share across the orchestrator task and observers.
pub trait ProjectFs: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Write `content`, creating parent directories as needed.
    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>>;

    /// UTF-8 read. Invalid bytes are an error, not a lossy conversion, so a
    /// corrupted source file is caught rather than silently mangled.
    fn read_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// OsFs
// ---------------------------------------------------------------------------

/// The production implementation: plain `std::fs` against the real tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl ProjectFs for OsFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            out.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MemFs — in-memory tree for tests
// ---------------------------------------------------------------------------

/// In-memory `ProjectFs` used by unit tests. Stores files in a sorted map
/// keyed by absolute path; directories exist implicitly.
#[derive(Debug, Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without going through `write`.
    pub fn seed(&self, path: impl Into<PathBuf>, content: &[u8]) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), content.to_vec());
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }
}

impl ProjectFs for MemFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock poisoned"))?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())))
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock poisoned"))?;
        files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock poisoned"))?;
        files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        let Ok(files) = self.files.lock() else {
            return false;
        };
        files.contains_key(path) || files.keys().any(|k| k.starts_with(path))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock poisoned"))?;
        let mut out: Vec<DirEntryInfo> = Vec::new();
        for (key, content) in files.iter() {
            let Ok(rest) = key.strip_prefix(path) else {
                continue;
            };
            let mut comps = rest.components();
            let Some(first) = comps.next() else {
                continue;
            };
            let name = first.as_os_str().to_string_lossy().into_owned();
            let is_dir = comps.next().is_some();
            if let Some(existing) = out.iter_mut().find(|e| e.name == name) {
                existing.is_dir = existing.is_dir || is_dir;
            } else {
                out.push(DirEntryInfo {
                    name,
                    is_dir,
                    size: if is_dir { 0 } else { content.len() as u64 },
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
