//! Parser/compiler adapter used by the syntax gate.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::io::process::{CommandLimits, run_command_with_timeout};

/// Result of checking one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    Ok,
    Error { message: String, line: Option<u32> },
}

/// Checks whether a file parses. Must be callable concurrently on distinct paths.
pub trait SyntaxChecker: Sync {
    fn check_syntax(&self, path: &Path) -> Result<SyntaxCheck>;
}

/// Compiles the file in memory; nothing is written next to the source, so a
/// check never leaves bytecode caches in the worktree.
const COMPILE_SNIPPET: &str =
    "import sys; compile(open(sys.argv[1], 'rb').read(), sys.argv[1], 'exec')";

/// Compiles Python sources with the configured runtime without importing them.
#[derive(Debug, Clone)]
pub struct PyCompileChecker {
    runtime: String,
    workdir: PathBuf,
    limits: CommandLimits,
}

impl PyCompileChecker {
    pub fn new(
        runtime: impl Into<String>,
        workdir: impl Into<PathBuf>,
        limits: CommandLimits,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            workdir: workdir.into(),
            limits,
        }
    }
}

impl SyntaxChecker for PyCompileChecker {
    fn check_syntax(&self, path: &Path) -> Result<SyntaxCheck> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["-B", "-c", COMPILE_SNIPPET])
            .arg(path)
            .current_dir(&self.workdir);
        let output =
            run_command_with_timeout(cmd, self.limits.timeout, self.limits.output_limit_bytes)
                .with_context(|| format!("compile {}", path.display()))?;
        if output.success() {
            return Ok(SyntaxCheck::Ok);
        }
        let stderr = output.stderr_text();
        debug!(path = %path.display(), "compiler rejected file");
        Ok(parse_compile_error(&stderr, output.timed_out))
    }
}

/// Turn compiler stderr into a one-line message plus the reported line number.
pub fn parse_compile_error(stderr: &str, timed_out: bool) -> SyntaxCheck {
    if timed_out {
        return SyntaxCheck::Error {
            message: "syntax check timed out".to_string(),
            line: None,
        };
    }
    static LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"line (\d+)").unwrap());
    let line = LINE_RE
        .captures_iter(stderr)
        .last()
        .and_then(|caps| caps[1].parse().ok());
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown syntax error")
        .to_string();
    SyntaxCheck::Error { message, line }
}
