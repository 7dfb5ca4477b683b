//! CodeNormalizer: rewrite line endings and indentation of matching source files.

use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use crate::core::types::{FailureKind, StageResult};
use crate::io::formatter::Formatter;
use crate::io::walk::{FileFilter, collect_files, parallel_map};
use crate::stage::{RunContext, Stage};

pub struct CodeNormalizer<'a> {
    pub formatter: &'a dyn Formatter,
    pub indent_width: usize,
    pub extensions: Vec<String>,
    pub excluded_dirs: Vec<String>,
}

impl Stage for CodeNormalizer<'_> {
    fn name(&self) -> &'static str {
        "code_normalizer"
    }

    fn required(&self) -> bool {
        false
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::NonFatal
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageResult> {
        let filter = FileFilter {
            extensions: &self.extensions,
            excluded_dirs: &self.excluded_dirs,
        };
        let scan = collect_files(&ctx.worktree, filter);
        let files = scan.files;
        let width = self.indent_width;
        let results = parallel_map(&files, |path| self.formatter.normalize(path, width));

        let mut changed: Vec<&PathBuf> = Vec::new();
        let mut failures = Vec::new();
        for (path, result) in files.iter().zip(results) {
            match result {
                Ok(true) => changed.push(path),
                Ok(false) => {}
                Err(err) => failures.push(format!("{}: {err:#}", ctx.display_path(path))),
            }
        }
        for entry in &scan.unreadable {
            failures.push(format!("{}: {}", ctx.display_path(&entry.path), entry.reason));
        }
        debug!(scanned = files.len(), changed = changed.len(), "normalized sources");

        if !changed.is_empty() {
            ctx.record_fix(format!("normalized {} file(s)", changed.len()));
        }
        let summary = format!("normalized {} of {} file(s)", changed.len(), files.len());
        if failures.is_empty() {
            return Ok(StageResult::ok(summary));
        }
        for failure in &failures {
            ctx.warn(format!("could not normalize {failure}"));
        }
        Ok(StageResult::warned(format!(
            "{summary}; {} could not be rewritten",
            failures.len()
        )))
    }
}
