//! SyntaxGate: verify every source file parses, with one bounded repair pass.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info};

use crate::core::types::{FailureKind, StageResult, SyntaxPolicy};
use crate::io::formatter::Formatter;
use crate::io::syntax::{SyntaxCheck, SyntaxChecker};
use crate::io::walk::{FileFilter, collect_files, parallel_map};
use crate::stage::{RunContext, Stage};

pub struct SyntaxGate<'a> {
    pub checker: &'a dyn SyntaxChecker,
    /// Used for the single repair attempt on failing files.
    pub formatter: &'a dyn Formatter,
    pub policy: SyntaxPolicy,
    pub indent_width: usize,
    pub extensions: Vec<String>,
    pub excluded_dirs: Vec<String>,
}

#[derive(Debug, Clone)]
struct SyntaxFailure {
    path: PathBuf,
    message: String,
    line: Option<u32>,
}

impl SyntaxGate<'_> {
    fn check_all(&self, files: &[PathBuf]) -> Vec<SyntaxFailure> {
        let checks = parallel_map(files, |path| self.checker.check_syntax(path));
        files
            .iter()
            .zip(checks)
            .filter_map(|(path, check)| match check {
                Ok(SyntaxCheck::Ok) => None,
                Ok(SyntaxCheck::Error { message, line }) => Some(SyntaxFailure {
                    path: path.clone(),
                    message,
                    line,
                }),
                Err(err) => Some(SyntaxFailure {
                    path: path.clone(),
                    message: format!("{err:#}"),
                    line: None,
                }),
            })
            .collect()
    }

    fn repair(&self, ctx: &mut RunContext, path: &Path) {
        match self.formatter.normalize(path, self.indent_width) {
            Ok(true) => {
                ctx.record_fix(format!("repaired indentation in {}", ctx.display_path(path)));
            }
            Ok(false) => debug!(path = %path.display(), "repair made no change"),
            Err(err) => {
                ctx.warn(format!("repair of {} failed: {err:#}", ctx.display_path(path)));
            }
        }
    }
}

fn describe(ctx: &RunContext, failures: &[SyntaxFailure]) -> String {
    let details: Vec<String> = failures
        .iter()
        .map(|f| match f.line {
            Some(line) => format!("{}:{line}: {}", ctx.display_path(&f.path), f.message),
            None => format!("{}: {}", ctx.display_path(&f.path), f.message),
        })
        .collect();
    format!(
        "{} file(s) failed to parse: {}",
        failures.len(),
        details.join("; ")
    )
}

impl Stage for SyntaxGate<'_> {
    fn name(&self) -> &'static str {
        "syntax_gate"
    }

    fn required(&self) -> bool {
        true
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::SyntaxFatal
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageResult> {
        let filter = FileFilter {
            extensions: &self.extensions,
            excluded_dirs: &self.excluded_dirs,
        };
        let scan = collect_files(&ctx.worktree, filter);
        let files = scan.files;
        // unreadable paths cannot be repaired; they go straight to the policy
        let mut remaining: Vec<SyntaxFailure> = scan
            .unreadable
            .into_iter()
            .map(|entry| SyntaxFailure {
                path: entry.path,
                message: format!("could not be read: {}", entry.reason),
                line: None,
            })
            .collect();

        let failing = self.check_all(&files);
        let mut repaired = 0;
        if !failing.is_empty() {
            info!(count = failing.len(), "attempting syntax repair");
            let paths: Vec<PathBuf> = failing.into_iter().map(|f| f.path).collect();
            for path in &paths {
                self.repair(ctx, path);
            }
            let still_failing = self.check_all(&paths);
            repaired = paths.len() - still_failing.len();
            remaining.extend(still_failing);
        }

        if remaining.is_empty() {
            if repaired == 0 {
                return Ok(StageResult::ok(format!("{} file(s) parse", files.len())));
            }
            return Ok(StageResult::ok(format!(
                "{} file(s) parse after repairing {repaired}",
                files.len()
            )));
        }

        let message = describe(ctx, &remaining);
        match self.policy {
            SyntaxPolicy::Strict => Ok(StageResult::failed(message)),
            SyntaxPolicy::Lenient => {
                ctx.warn(message.clone());
                Ok(StageResult::warned(message))
            }
        }
    }
}
