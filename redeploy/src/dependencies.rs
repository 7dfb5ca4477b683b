//! DependencyInstaller: install the manifest, falling back to a minimal package set.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use crate::core::retry::RetryPolicy;
use crate::core::types::{FailureKind, StageResult};
use crate::io::clock::{Sleeper, retry_with_backoff};
use crate::io::packages::PackageInstaller;
use crate::stage::{RunContext, Stage};

pub struct DependencyInstaller<'a> {
    pub installer: &'a dyn PackageInstaller,
    /// Absolute path of the dependency manifest.
    pub manifest: PathBuf,
    pub fallback: Vec<String>,
    pub retry: RetryPolicy,
    pub sleeper: &'a dyn Sleeper,
}

impl DependencyInstaller<'_> {
    fn install_fallback(&self, ctx: &mut RunContext, primary_err: String) -> StageResult {
        if self.fallback.is_empty() {
            return StageResult::failed(format!("{primary_err}; no fallback package set configured"))
                .retriable(true);
        }
        ctx.warn(format!("{primary_err}; installing fallback set"));
        let installed = retry_with_backoff(&self.retry, self.sleeper, "install fallback", || {
            self.installer.install_set(&self.fallback)
        });
        match installed {
            Ok(()) => {
                let set = self.fallback.join(", ");
                ctx.record_fix(format!("installed fallback packages: {set}"));
                StageResult::warned(format!("{primary_err}; installed fallback set: {set}"))
            }
            Err(err) => StageResult::failed(format!(
                "{primary_err}; fallback install failed: {err:#}"
            ))
            .retriable(true),
        }
    }
}

impl Stage for DependencyInstaller<'_> {
    fn name(&self) -> &'static str {
        "dependency_installer"
    }

    fn required(&self) -> bool {
        true
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::DependencyFatal
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageResult> {
        let manifest = ctx.display_path(&self.manifest);
        if !self.manifest.is_file() {
            return Ok(self.install_fallback(ctx, format!("manifest {manifest} not found")));
        }

        let installed = retry_with_backoff(&self.retry, self.sleeper, "install manifest", || {
            self.installer.install_manifest(&self.manifest)
        });
        match installed {
            Ok(()) => {
                info!(%manifest, "dependencies installed");
                Ok(StageResult::ok(format!("installed {manifest}")))
            }
            Err(err) => Ok(self.install_fallback(
                ctx,
                format!("manifest {manifest} install failed: {err:#}"),
            )),
        }
    }
}
