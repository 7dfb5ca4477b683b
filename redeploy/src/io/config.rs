//! Deployment configuration stored in `redeploy.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::types::{ProcessDescriptor, SyntaxPolicy};
use crate::io::process::CommandLimits;

pub const DEFAULT_CONFIG_FILE: &str = "redeploy.toml";

/// Deployment configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below. Relative paths resolve against `worktree`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    /// Working tree to deploy from.
    pub worktree: PathBuf,
    pub remote: String,
    pub branch: String,
    /// Push local save-point commits back to the remote after integration.
    pub publish: bool,
    pub syntax_policy: SyntaxPolicy,
    pub indent_width: usize,
    /// Extensions rewritten by the normalizer.
    pub normalize_extensions: Vec<String>,
    /// Extensions checked by the syntax gate.
    pub syntax_extensions: Vec<String>,
    /// Directory names never walked (virtualenvs, VCS metadata, caches).
    pub excluded_dirs: Vec<String>,
    pub environment: EnvironmentConfig,
    pub dependencies: DependencyConfig,
    pub process: ProcessDescriptor,
    pub supervisor: SupervisorConfig,
    /// Health polling after a start or restart.
    pub health: RetryPolicy,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Dotenv-style file holding the worker's configuration values.
    pub file: PathBuf,
    pub required_keys: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(".env"),
            required_keys: strings(&[
                "HF_TOKEN",
                "TELEGRAM_BOT_TOKEN",
                "TELEGRAM_CHAT_ID",
                "FXOPEN_LOGIN",
                "FXOPEN_API_KEY",
                "FXOPEN_API_SECRET",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DependencyConfig {
    pub manifest: PathBuf,
    /// Minimal package set installed when the manifest cannot be.
    pub fallback: Vec<String>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("requirements.txt"),
            fallback: strings(&[
                "python-dotenv",
                "apscheduler",
                "requests",
                "python-telegram-bot",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Supervisor executable (pm2-compatible CLI).
    pub program: String,
    pub persist_state: bool,
    pub enable_on_boot: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: "pm2".to_string(),
            persist_state: true,
            enable_on_boot: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Upper bound for any single backend command.
    pub timeout_secs: u64,
    /// Retries for network-bound operations (fetch, installs).
    pub retry: RetryPolicy,
    /// Truncate captured command output beyond this many bytes.
    pub command_output_limit_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            retry: RetryPolicy::default(),
            command_output_limit_bytes: 100_000,
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            worktree: PathBuf::from("."),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            publish: false,
            syntax_policy: SyntaxPolicy::Lenient,
            indent_width: 4,
            normalize_extensions: strings(&["py", "sh", "txt", "json", "md", "env"]),
            syntax_extensions: strings(&["py"]),
            excluded_dirs: strings(&[
                ".git",
                "__pycache__",
                "venv",
                ".venv",
                "env",
                "node_modules",
                ".mypy_cache",
                ".pytest_cache",
                ".redeploy",
            ]),
            environment: EnvironmentConfig::default(),
            dependencies: DependencyConfig::default(),
            process: ProcessDescriptor::default(),
            supervisor: SupervisorConfig::default(),
            health: RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(8)),
            network: NetworkConfig::default(),
        }
    }
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must be non-empty"));
        }
        if self.branch.trim().is_empty() {
            return Err(anyhow!("branch must be non-empty"));
        }
        if self.indent_width == 0 {
            return Err(anyhow!("indent_width must be > 0"));
        }
        if self.normalize_extensions.is_empty() {
            return Err(anyhow!("normalize_extensions must be a non-empty array"));
        }
        if self.syntax_extensions.is_empty() {
            return Err(anyhow!("syntax_extensions must be a non-empty array"));
        }
        if self.process.name.trim().is_empty() {
            return Err(anyhow!("process.name must be non-empty"));
        }
        if self.process.entrypoint.trim().is_empty() {
            return Err(anyhow!("process.entrypoint must be non-empty"));
        }
        if self.process.runtime.trim().is_empty() {
            return Err(anyhow!("process.runtime must be non-empty"));
        }
        if self.supervisor.program.trim().is_empty() {
            return Err(anyhow!("supervisor.program must be non-empty"));
        }
        if self.network.timeout_secs == 0 {
            return Err(anyhow!("network.timeout_secs must be > 0"));
        }
        if self.network.command_output_limit_bytes == 0 {
            return Err(anyhow!("network.command_output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Resolve `path` against the worktree unless it is already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.worktree.join(path)
        }
    }

    pub fn command_limits(&self) -> CommandLimits {
        CommandLimits {
            timeout: Duration::from_secs(self.network.timeout_secs),
            output_limit_bytes: self.network.command_output_limit_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DeployConfig::default()`. A relative
/// `worktree` resolves against the directory containing the file.
pub fn load_config(path: &Path) -> Result<DeployConfig> {
    if !path.exists() {
        let cfg = DeployConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: DeployConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if cfg.worktree.is_relative()
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        cfg.worktree = parent.join(&cfg.worktree);
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DeployConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
