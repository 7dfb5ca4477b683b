//! The stage contract shared by every pipeline step.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::types::{FailureKind, ManagedProcess, StageResult};

/// Mutable state threaded through one run. Owned by the orchestrator for the
/// duration of that run and never shared between runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub worktree: PathBuf,
    /// Configuration values visible to the worker.
    pub env: BTreeMap<String, String>,
    pub applied_fixes: Vec<String>,
    pub warnings: Vec<String>,
    pub process: Option<ManagedProcess>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            worktree: worktree.into(),
            env,
            applied_fixes: Vec::new(),
            warnings: Vec::new(),
            process: None,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "run warning");
        self.warnings.push(message);
    }

    pub fn record_fix(&mut self, fix: impl Into<String>) {
        let fix = fix.into();
        info!(%fix, "applied fix");
        self.applied_fixes.push(fix);
    }

    /// Path relative to the worktree for messages; absolute when outside it.
    pub fn display_path(&self, path: &std::path::Path) -> String {
        match path.strip_prefix(&self.worktree) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// One idempotent step of the deployment.
///
/// Running a stage twice with unchanged inputs must leave the same end state
/// and report success the second time.
pub trait Stage {
    fn name(&self) -> &'static str;
    /// A `Failed` result from a required stage aborts the run.
    fn required(&self) -> bool;
    /// Exit-code category used when this stage aborts the run.
    fn failure_kind(&self) -> FailureKind;
    /// Backend errors that escape as `Err` are recorded as `Failed` by the orchestrator.
    fn run(&self, ctx: &mut RunContext) -> Result<StageResult>;
}
