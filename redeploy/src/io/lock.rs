//! Exclusive per-worktree run lock.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

/// Another run already holds the lock for this worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyRunningError {
    pub lock_path: PathBuf,
}

impl fmt::Display for AlreadyRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "another deployment is already running (lock held: {})",
            self.lock_path.display()
        )
    }
}

impl std::error::Error for AlreadyRunningError {}

/// Held for the duration of a run; the OS lock is released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting.
    ///
    /// Fails with [`AlreadyRunningError`] when another holder exists.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open run lock {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Err(AlreadyRunningError {
                lock_path: path.to_path_buf(),
            }
            .into());
        }
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "run lock released");
    }
}
