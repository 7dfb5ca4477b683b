//! Package-installation adapter (pip through the worker's interpreter).

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::io::process::{CommandLimits, run_checked};

pub trait PackageInstaller {
    /// Install everything declared in the manifest at `manifest`.
    fn install_manifest(&self, manifest: &Path) -> Result<()>;
    /// Install an explicit list of packages.
    fn install_set(&self, names: &[String]) -> Result<()>;
}

/// Installs packages with `<runtime> -m pip install`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    runtime: String,
    workdir: PathBuf,
    limits: CommandLimits,
}

impl PipInstaller {
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

impl PackageInstaller for PipInstaller {
    #[instrument(skip_all, fields(manifest = %manifest.display()))]
    fn install_manifest(&self, manifest: &Path) -> Result<()> {
        if !manifest.is_file() {
            return Err(anyhow!("manifest {} not found", manifest.display()));
        }
        let manifest_arg = manifest.to_string_lossy();
        run_checked(
            &self.runtime,
            &["-m", "pip", "install", "-q", "-r", &manifest_arg],
            &self.workdir,
            self.limits,
        )?;
        info!("manifest installed");
        Ok(())
    }

    #[instrument(skip_all, fields(count = names.len()))]
    fn install_set(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Err(anyhow!("empty package set"));
        }
        let mut args = vec!["-m", "pip", "install", "-q"];
        args.extend(names.iter().map(String::as_str));
        run_checked(&self.runtime, &args, &self.workdir, self.limits)?;
        info!("package set installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_manifest_is_an_error_without_spawning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pip = PipInstaller::new(
            "definitely-not-a-python",
            temp.path(),
            CommandLimits::default(),
        );
        let err = pip
            .install_manifest(&temp.path().join("requirements.txt"))
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn empty_set_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pip = PipInstaller::new("python3", temp.path(), CommandLimits::default());
        assert!(pip.install_set(&[]).is_err());
    }
}
