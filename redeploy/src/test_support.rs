//! Test-only fakes for every backend seam, plus a temporary worktree helper.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::retry::RetryPolicy;
use crate::core::types::{ObservedState, ProcessDescriptor};
use crate::io::clock::Sleeper;
use crate::io::config::DeployConfig;
use crate::io::git::{CommitOutcome, IntegrateOutcome, Vcs};
use crate::io::packages::PackageInstaller;
use crate::io::supervisor::{LogStream, Supervisor};
use crate::io::syntax::{SyntaxCheck, SyntaxChecker};
use crate::stage::RunContext;

/// Marker that makes [`FakeSyntaxChecker`] report an unrepairable error.
pub const BROKEN_MARKER: &str = "<<<";

/// A throwaway worktree on disk.
pub struct TestTree {
    dir: TempDir,
}

impl TestTree {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        self.write_bytes(rel, contents.as_bytes())
    }

    pub fn write_bytes(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).expect("read file")
    }

    pub fn context(&self) -> RunContext {
        RunContext::new("run-test", self.path(), BTreeMap::new())
    }

    /// Config pointing at this tree with zero-delay retries.
    pub fn config(&self) -> DeployConfig {
        DeployConfig {
            worktree: self.path().to_path_buf(),
            health: RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(20)),
            network: crate::io::config::NetworkConfig {
                retry: RetryPolicy::NONE,
                ..Default::default()
            },
            ..DeployConfig::default()
        }
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeper that records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("lock").clone()
    }

    pub fn total(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().expect("lock").push(duration);
    }
}

#[derive(Debug, Default)]
struct VcsState {
    dirty: bool,
    behind: bool,
    diverged: bool,
    fetch_failures: u32,
    failing_commit: bool,
    failing_shelve: bool,
    failing_publish: bool,
    kept_out: Vec<PathBuf>,
    calls: Vec<String>,
}

/// In-memory version control with scripted failures.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(self, f: impl FnOnce(&mut VcsState)) -> Self {
        f(&mut self.state.lock().expect("lock"));
        self
    }

    pub fn dirty(self) -> Self {
        self.update(|s| s.dirty = true)
    }

    /// Remote has commits the worktree lacks; the next integrate applies them.
    pub fn behind(self) -> Self {
        self.update(|s| s.behind = true)
    }

    pub fn diverged(self) -> Self {
        self.update(|s| s.diverged = true)
    }

    pub fn fetch_failures(self, count: u32) -> Self {
        self.update(|s| s.fetch_failures = count)
    }

    pub fn failing_commit(self) -> Self {
        self.update(|s| s.failing_commit = true)
    }

    pub fn failing_shelve(self) -> Self {
        self.update(|s| s.failing_shelve = true)
    }

    pub fn failing_publish(self) -> Self {
        self.update(|s| s.failing_publish = true)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().expect("lock").dirty
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("lock").calls.clone()
    }

    /// Paths the last commit or shelve was asked to leave alone.
    pub fn kept_out(&self) -> Vec<PathBuf> {
        self.state.lock().expect("lock").kept_out.clone()
    }

    fn call(&self, name: &str) -> std::sync::MutexGuard<'_, VcsState> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(name.to_string());
        state
    }
}

impl Vcs for FakeVcs {
    fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(self.call("status").dirty)
    }

    fn commit(&self, _message: &str, keep_out: &[PathBuf]) -> Result<CommitOutcome> {
        let mut state = self.call("commit");
        state.kept_out = keep_out.to_vec();
        if state.failing_commit {
            return Err(anyhow!("commit hook rejected the commit"));
        }
        if !state.dirty {
            return Ok(CommitOutcome::NothingToCommit);
        }
        state.dirty = false;
        Ok(CommitOutcome::Committed)
    }

    fn shelve(&self, _label: &str, keep_out: &[PathBuf]) -> Result<()> {
        let mut state = self.call("shelve");
        state.kept_out = keep_out.to_vec();
        if state.failing_shelve {
            return Err(anyhow!("stash failed"));
        }
        state.dirty = false;
        Ok(())
    }

    fn fetch(&self, _remote: &str, _branch: &str) -> Result<()> {
        let mut state = self.call("fetch");
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(anyhow!("could not resolve host"));
        }
        Ok(())
    }

    fn integrate(&self, _remote: &str, _branch: &str) -> Result<IntegrateOutcome> {
        let mut state = self.call("integrate");
        if state.diverged {
            return Err(anyhow!("CONFLICT (content): merge conflict in main.py"));
        }
        if state.behind {
            state.behind = false;
            return Ok(IntegrateOutcome::Updated);
        }
        Ok(IntegrateOutcome::UpToDate)
    }

    fn publish(&self, _remote: &str, _branch: &str) -> Result<()> {
        let state = self.call("publish");
        if state.failing_publish {
            return Err(anyhow!("permission denied"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PackagesState {
    failing_manifest: bool,
    failing_set: bool,
    calls: Vec<String>,
}

/// Package installer that records which install path was taken.
#[derive(Debug, Default)]
pub struct FakePackages {
    state: Mutex<PackagesState>,
}

impl FakePackages {
    pub fn failing_manifest(self) -> Self {
        self.state.lock().expect("lock").failing_manifest = true;
        self
    }

    pub fn failing_set(self) -> Self {
        self.state.lock().expect("lock").failing_set = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("lock").calls.clone()
    }
}

impl PackageInstaller for FakePackages {
    fn install_manifest(&self, _manifest: &Path) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push("manifest".to_string());
        if state.failing_manifest {
            return Err(anyhow!("No matching distribution found"));
        }
        Ok(())
    }

    fn install_set(&self, _names: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push("set".to_string());
        if state.failing_set {
            return Err(anyhow!("network unreachable"));
        }
        Ok(())
    }
}

/// Content-based syntax checker.
///
/// A line containing [`BROKEN_MARKER`] is an unrepairable error; a line
/// starting with a tab is an indentation error the formatter can fix.
#[derive(Debug, Default)]
pub struct FakeSyntaxChecker {
    checks: AtomicUsize,
}

impl FakeSyntaxChecker {
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl SyntaxChecker for FakeSyntaxChecker {
    fn check_syntax(&self, path: &Path) -> Result<SyntaxCheck> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let text = fs::read_to_string(path)?;
        for (idx, line) in text.lines().enumerate() {
            let line_no = Some(idx as u32 + 1);
            if line.contains(BROKEN_MARKER) {
                return Ok(SyntaxCheck::Error {
                    message: "invalid syntax".to_string(),
                    line: line_no,
                });
            }
            if line.starts_with('\t') {
                return Ok(SyntaxCheck::Error {
                    message: "inconsistent use of tabs and spaces in indentation".to_string(),
                    line: line_no,
                });
            }
        }
        Ok(SyntaxCheck::Ok)
    }
}

#[derive(Debug)]
struct SupervisorState {
    current: ObservedState,
    polls: VecDeque<ObservedState>,
    on_restart: Vec<ObservedState>,
    on_start: Vec<ObservedState>,
    describe_failures: u32,
    failing_restart: bool,
    failing_start: bool,
    failing_persist: bool,
    instances: u32,
    peak_instances: u32,
    calls: Vec<String>,
}

/// Scripted process supervisor.
///
/// After a start or restart, `describe` walks through the scripted states and
/// then keeps returning the last one.
#[derive(Debug)]
pub struct FakeSupervisor {
    state: Mutex<SupervisorState>,
}

impl FakeSupervisor {
    fn with_current(current: ObservedState) -> Self {
        let instances = u32::from(current != ObservedState::Unknown);
        Self {
            state: Mutex::new(SupervisorState {
                current,
                polls: VecDeque::new(),
                on_restart: vec![ObservedState::Online],
                on_start: vec![ObservedState::Online],
                describe_failures: 0,
                failing_restart: false,
                failing_start: false,
                failing_persist: false,
                instances,
                peak_instances: instances,
                calls: Vec::new(),
            }),
        }
    }

    pub fn absent() -> Self {
        Self::with_current(ObservedState::Unknown)
    }

    pub fn existing(state: ObservedState) -> Self {
        Self::with_current(state)
    }

    fn update(self, f: impl FnOnce(&mut SupervisorState)) -> Self {
        f(&mut self.state.lock().expect("lock"));
        self
    }

    pub fn on_restart(self, states: Vec<ObservedState>) -> Self {
        self.update(|s| s.on_restart = states)
    }

    pub fn on_start(self, states: Vec<ObservedState>) -> Self {
        self.update(|s| s.on_start = states)
    }

    /// The next `count` calls to `describe` fail as if the supervisor were unreachable.
    pub fn failing_describe(self, count: u32) -> Self {
        self.update(|s| s.describe_failures = count)
    }

    pub fn failing_restart(self) -> Self {
        self.update(|s| s.failing_restart = true)
    }

    pub fn failing_start(self) -> Self {
        self.update(|s| s.failing_start = true)
    }

    pub fn failing_persist(self) -> Self {
        self.update(|s| s.failing_persist = true)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("lock").calls.clone()
    }

    /// Most instances ever registered at the same time.
    pub fn peak_instances(&self) -> u32 {
        self.state.lock().expect("lock").peak_instances
    }

    pub fn current(&self) -> ObservedState {
        self.state.lock().expect("lock").current
    }

    fn call(&self, name: &str) -> std::sync::MutexGuard<'_, SupervisorState> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(name.to_string());
        state
    }
}

impl Supervisor for FakeSupervisor {
    fn describe(&self, _name: &str) -> Result<ObservedState> {
        let mut state = self.state.lock().expect("lock");
        if state.describe_failures > 0 {
            state.describe_failures -= 1;
            return Err(anyhow!("[PM2] daemon not responding"));
        }
        if let Some(next) = state.polls.pop_front() {
            state.current = next;
        }
        Ok(state.current)
    }

    fn start(&self, _process: &ProcessDescriptor) -> Result<()> {
        let mut state = self.call("start");
        if state.failing_start {
            return Err(anyhow!("[PM2][ERROR] Script not found"));
        }
        state.instances += 1;
        state.peak_instances = state.peak_instances.max(state.instances);
        state.current = ObservedState::Starting;
        state.polls = state.on_start.iter().copied().collect();
        Ok(())
    }

    fn restart(&self, _name: &str) -> Result<()> {
        let mut state = self.call("restart");
        if state.failing_restart {
            return Err(anyhow!("[PM2][ERROR] Process not found"));
        }
        state.current = ObservedState::Starting;
        state.polls = state.on_restart.iter().copied().collect();
        Ok(())
    }

    fn stop(&self, _name: &str) -> Result<()> {
        let mut state = self.call("stop");
        state.polls.clear();
        state.current = ObservedState::Crashed;
        Ok(())
    }

    fn delete(&self, _name: &str) -> Result<()> {
        let mut state = self.call("delete");
        state.polls.clear();
        state.instances = state.instances.saturating_sub(1);
        state.current = ObservedState::Unknown;
        Ok(())
    }

    fn tail_logs(&self, _name: &str, lines: usize, _stream: LogStream) -> Result<Vec<String>> {
        let all = [
            "Traceback (most recent call last):",
            "  File \"main.py\", line 3, in <module>",
            "KeyError: 'TELEGRAM_BOT_TOKEN'",
        ];
        Ok(all.iter().take(lines).map(|s| s.to_string()).collect())
    }

    fn persist_state(&self) -> Result<()> {
        let state = self.call("persist");
        if state.failing_persist {
            return Err(anyhow!("dump failed"));
        }
        Ok(())
    }

    fn enable_on_boot(&self) -> Result<()> {
        self.call("startup");
        Ok(())
    }
}
