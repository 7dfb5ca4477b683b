//! The `.redeploy/` state directory inside a worktree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

const STATE_GITIGNORE: &str = "*\n";

/// Canonical paths within `.redeploy/` for a worktree.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub lock_path: PathBuf,
    pub cancel_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".redeploy");
        Self {
            root,
            gitignore_path: state_dir.join(".gitignore"),
            lock_path: state_dir.join("run.lock"),
            cancel_path: state_dir.join("cancel"),
            state_dir,
        }
    }
}

/// Create `.redeploy/` with a `.gitignore` that hides it from version control.
///
/// Writes nothing when the directory is already in place.
pub fn ensure_state_dir(root: &Path) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "{} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create {}", paths.state_dir.display()))?;
    let current = fs::read_to_string(&paths.gitignore_path).ok();
    if current.as_deref() != Some(STATE_GITIGNORE) {
        fs::write(&paths.gitignore_path, STATE_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    Ok(paths)
}
