//! Per-execution scratch directories.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::Result;

/// A uniquely named temporary directory holding one execution's artifacts.
///
/// Removed on [`ScratchDir::close`] or drop. Removal failures are logged,
/// never returned.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh scratch directory under the system temp dir.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("polybook-").tempdir()?;
        let path = dir.path().to_path_buf();
        tracing::debug!(path = %path.display(), "created scratch dir");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `contents` to `name` inside the directory.
    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let file = self.path.join(name);
        std::fs::write(&file, contents)?;
        Ok(file)
    }

    /// Remove the directory and everything in it.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(e) = dir.close()
        {
            tracing::warn!(path = %self.path.display(), "failed to remove scratch dir: {}", e);
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        self.remove();
    }
}
