//! Process-supervisor adapter (pm2).

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::{ObservedState, ProcessDescriptor};
use crate::io::process::{CommandLimits, run_checked};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogStream {
    Out,
    Err,
}

/// Operations the pipeline consumes from a process supervisor.
pub trait Supervisor {
    /// Current state of the instance named `name`; `Unknown` when none exists.
    fn describe(&self, name: &str) -> Result<ObservedState>;
    fn start(&self, process: &ProcessDescriptor) -> Result<()>;
    fn restart(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
    /// Forget the instance entirely so a fresh start cannot duplicate it.
    fn delete(&self, name: &str) -> Result<()>;
    fn tail_logs(&self, name: &str, lines: usize, stream: LogStream) -> Result<Vec<String>>;
    /// Save the process list so it survives a supervisor restart.
    fn persist_state(&self) -> Result<()>;
    fn enable_on_boot(&self) -> Result<()>;
}

/// Drives the `pm2` CLI.
#[derive(Debug, Clone)]
pub struct Pm2Supervisor {
    program: String,
    workdir: PathBuf,
    limits: CommandLimits,
}

impl Pm2Supervisor {
    pub fn new(
        program: impl Into<String>,
        workdir: impl Into<PathBuf>,
        limits: CommandLimits,
    ) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
            limits,
        }
    }

    fn pm2(&self, args: &[&str]) -> Result<String> {
        let output = run_checked(&self.program, args, &self.workdir, self.limits)?;
        Ok(output.stdout_text())
    }
}

impl Supervisor for Pm2Supervisor {
    #[instrument(skip_all, fields(name))]
    fn describe(&self, name: &str) -> Result<ObservedState> {
        let raw = self.pm2(&["jlist"])?;
        let state = observed_state_from_jlist(&raw, name)?;
        debug!(%state, "described process");
        Ok(state)
    }

    #[instrument(skip_all, fields(name = %process.name))]
    fn start(&self, process: &ProcessDescriptor) -> Result<()> {
        self.pm2(&[
            "start",
            &process.entrypoint,
            "--name",
            &process.name,
            "--interpreter",
            &process.runtime,
        ])?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn restart(&self, name: &str) -> Result<()> {
        self.pm2(&["restart", name])?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn stop(&self, name: &str) -> Result<()> {
        self.pm2(&["stop", name])?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn delete(&self, name: &str) -> Result<()> {
        self.pm2(&["delete", name])?;
        Ok(())
    }

    fn tail_logs(&self, name: &str, lines: usize, stream: LogStream) -> Result<Vec<String>> {
        let count = lines.to_string();
        let flag = match stream {
            LogStream::Out => "--out",
            LogStream::Err => "--err",
        };
        let raw = self.pm2(&["logs", name, "--lines", &count, "--nostream", flag])?;
        Ok(log_lines(&raw, lines))
    }

    fn persist_state(&self) -> Result<()> {
        self.pm2(&["save"])?;
        Ok(())
    }

    fn enable_on_boot(&self) -> Result<()> {
        self.pm2(&["startup"])?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pm2_env: JlistEnv,
}

#[derive(Debug, Default, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: String,
}

/// Map `pm2 jlist` output to the observed state of `name`.
///
/// Duplicate entries under one name resolve to the healthiest state seen.
pub fn observed_state_from_jlist(raw: &str, name: &str) -> Result<ObservedState> {
    let entries: Vec<JlistEntry> = serde_json::from_str(raw.trim()).context("parse pm2 jlist")?;
    let state = entries
        .iter()
        .filter(|entry| entry.name == name)
        .map(|entry| map_pm2_status(&entry.pm2_env.status))
        .max_by_key(|state| state_rank(*state))
        .unwrap_or(ObservedState::Unknown);
    Ok(state)
}

fn map_pm2_status(status: &str) -> ObservedState {
    match status {
        "online" => ObservedState::Online,
        "launching" => ObservedState::Starting,
        "errored" | "stopped" | "stopping" | "one-launch-status" => ObservedState::Crashed,
        _ => ObservedState::Unknown,
    }
}

fn state_rank(state: ObservedState) -> u8 {
    match state {
        ObservedState::Unknown => 0,
        ObservedState::Crashed => 1,
        ObservedState::Starting => 2,
        ObservedState::Online => 3,
    }
}

/// Drop pm2 banner lines and keep the last `limit` log lines.
fn log_lines(raw: &str, limit: usize) -> Vec<String> {
    let lines: Vec<String> = raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("[TAILING]"))
        .filter(|line| !line.trim_end().ends_with("lines:"))
        .map(str::to_string)
        .collect();
    let skip = lines.len().saturating_sub(limit);
    lines.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jlist_maps_statuses() {
        let raw = r#"[
            {"name":"trading-bot","pm2_env":{"status":"online"}},
            {"name":"other","pm2_env":{"status":"errored"}}
        ]"#;
        assert_eq!(
            observed_state_from_jlist(raw, "trading-bot").expect("parse"),
            ObservedState::Online
        );
        assert_eq!(
            observed_state_from_jlist(raw, "other").expect("parse"),
            ObservedState::Crashed
        );
        assert_eq!(
            observed_state_from_jlist(raw, "missing").expect("parse"),
            ObservedState::Unknown
        );
    }

    #[test]
    fn duplicate_names_resolve_to_healthiest() {
        let raw = r#"[
            {"name":"bot","pm2_env":{"status":"stopped"}},
            {"name":"bot","pm2_env":{"status":"launching"}}
        ]"#;
        assert_eq!(
            observed_state_from_jlist(raw, "bot").expect("parse"),
            ObservedState::Starting
        );
    }

    #[test]
    fn empty_process_list_is_unknown() {
        assert_eq!(
            observed_state_from_jlist("[]\n", "bot").expect("parse"),
            ObservedState::Unknown
        );
    }

    #[test]
    fn log_lines_strip_banner_and_keep_tail() {
        let raw = "[TAILING] Tailing last 3 lines for [bot] process \
                   (change the value with --lines option)\n\
/root/.pm2/logs/bot-error.log last 3 lines:\n0|bot | a\n0|bot | b\n0|bot | c\n";
        assert_eq!(log_lines(raw, 2), vec!["0|bot | b", "0|bot | c"]);
    }
}
