//! Blob storage backend contract and the filesystem implementation.
//!
//! Write protocol: `make_write_file -> append -> save`. `save` is the commit
//! point; a key is never visible to readers before `save` returns. `save`
//! may fail transiently, so commit paths go through [`retry_with_backoff`].
//!
//! Backends must be thread-safe for independent open/read/write streams:
//! every stage thread of a worker shares one backend handle.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use strobe_common::{Result, StrobeError};
use tracing::{debug, warn};

/// Base delay for commit retries.
const BACKOFF_BASE_MS: u64 = 50;
/// Attempts before a transient failure becomes fatal.
const BACKOFF_MAX_ATTEMPTS: u32 = 5;

/// An open, uncommitted write stream for one key.
pub trait WriteFile: Send {
    /// Append bytes to the uncommitted stream.
    fn append(&mut self, data: &[u8]) -> Result<()>;
    /// Commit the stream, making the key visible. Consumes the handle.
    fn save(self: Box<Self>) -> Result<()>;
}

/// Opaque blob store with open/read/write/save semantics.
pub trait StorageBackend: Send + Sync {
    /// Open an uncommitted write stream for `key`, replacing any previous
    /// in-progress stream for the same key.
    fn make_write_file(&self, key: &str) -> Result<Box<dyn WriteFile>>;
    /// Read a committed blob in full.
    fn read_blob(&self, key: &str) -> Result<Vec<u8>>;
    /// Whether a committed blob exists for `key`.
    fn exists(&self, key: &str) -> bool;
}

/// Run `op` with exponential backoff on failure; bounded attempts, fatal on
/// exhaustion. Retries every error: the backends cannot distinguish
/// transient from permanent failures, and a bounded retry of a permanent one
/// only delays the abort.
pub fn retry_with_backoff<T>(label: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(BACKOFF_BASE_MS);
    let mut last_err = None;
    for attempt in 0..BACKOFF_MAX_ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(label, attempt, error = %e, "storage operation failed, backing off");
                last_err = Some(e);
                thread::sleep(delay);
                delay *= 2;
            }
        }
    }
    Err(StrobeError::Storage(format!(
        "{label}: retries exhausted after {BACKOFF_MAX_ATTEMPTS} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Commit `payload` under `key` through the write/save triad with backoff.
pub fn save_blob(backend: &dyn StorageBackend, key: &str, payload: &[u8]) -> Result<()> {
    retry_with_backoff(key, || {
        let mut out = backend.make_write_file(key)?;
        out.append(payload)?;
        out.save()
    })
}

/// Filesystem-backed blob store rooted at one directory.
///
/// Commit is a temp-file write followed by an atomic rename onto the final
/// path, so readers only ever observe fully written blobs.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn abs(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

struct FsWriteFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    committed: bool,
}

impl WriteFile for FsWriteFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn save(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;
        debug!(key = %self.final_path.display(), "blob committed");
        Ok(())
    }
}

impl Drop for FsWriteFile {
    fn drop(&mut self) {
        // Uncommitted stream: best-effort cleanup of the temp file.
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

impl StorageBackend for FsBackend {
    fn make_write_file(&self, key: &str) -> Result<Box<dyn WriteFile>> {
        let final_path = self.abs(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(&final_path);
        let file = File::create(&tmp_path)?;
        Ok(Box::new(FsWriteFile {
            tmp_path,
            final_path,
            file,
            committed: false,
        }))
    }

    fn read_blob(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.abs(key))
            .map_err(|e| StrobeError::Storage(format!("read of {key} failed: {e}")))
    }

    fn exists(&self, key: &str) -> bool {
        self.abs(key).is_file()
    }
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    final_path.with_file_name(name)
}
