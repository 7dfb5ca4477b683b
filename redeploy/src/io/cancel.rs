//! External abort requests, honoured at stage boundaries.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

use crate::exit_codes;

/// Shared cancellation flag, optionally backed by a sentinel file that another
/// process (`redeploy cancel`) can create.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sentinel(path: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::default(),
            sentinel: Some(path.into()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.sentinel.as_deref().is_some_and(Path::exists)
    }

    /// Remove a stale sentinel left behind by an earlier request.
    pub fn clear_sentinel(&self) -> Result<()> {
        if let Some(path) = &self.sentinel
            && path.exists()
        {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// Turn SIGINT and SIGTERM into a request on `token`.
///
/// The first signal lets the current stage finish; a second one exits with
/// [`exit_codes::CANCELLED`] straight away. Installs a process-wide handler,
/// so call it at most once.
pub fn cancel_on_signal(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.flag.swap(true, Ordering::SeqCst) {
            warn!("second interrupt; exiting without waiting for the stage");
            std::process::exit(exit_codes::CANCELLED);
        }
        warn!("interrupt received; stopping before the next stage");
    })
    .context("install signal handler")
}

/// Ask an in-flight run in the same worktree to stop at its next stage boundary.
pub fn request_cancel(sentinel: &Path) -> Result<()> {
    if let Some(parent) = sentinel.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(sentinel, "").with_context(|| format!("write {}", sentinel.display()))
}
