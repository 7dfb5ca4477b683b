//! Version-control adapter for source synchronization.
//!
//! The pipeline only needs a handful of operations, so we keep a small,
//! explicit wrapper around `git` subprocess calls behind the [`Vcs`] trait.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandLimits, CommandOutput, run_command_with_timeout};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Nothing was staged; no commit was created.
    NothingToCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrateOutcome {
    /// HEAD already contained the remote branch.
    UpToDate,
    /// Local commits were replayed on top of the remote branch.
    Updated,
}

/// Operations the pipeline consumes from a version-control backend.
pub trait Vcs {
    fn has_uncommitted_changes(&self) -> Result<bool>;
    /// Stage everything except `keep_out` and commit. Returns `NothingToCommit`
    /// when nothing outside `keep_out` changed.
    fn commit(&self, message: &str, keep_out: &[PathBuf]) -> Result<CommitOutcome>;
    /// Save uncommitted work (including untracked files) under `label`,
    /// leaving `keep_out` in place.
    fn shelve(&self, label: &str, keep_out: &[PathBuf]) -> Result<()>;
    /// Download `remote/branch`. Network-bound; callers apply retries.
    fn fetch(&self, remote: &str, branch: &str) -> Result<()>;
    /// Rebase local history onto `remote/branch`. An error means unresolved
    /// divergence; the working tree is left as it was before the call.
    fn integrate(&self, remote: &str, branch: &str) -> Result<IntegrateOutcome>;
    fn publish(&self, remote: &str, branch: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    limits: CommandLimits,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, limits: CommandLimits) -> Self {
        Self {
            workdir: workdir.into(),
            limits,
        }
    }

    /// Return the full HEAD sha.
    pub fn head(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes except `keep_out` (respects .gitignore).
    pub fn add_all(&self, keep_out: &[PathBuf]) -> Result<()> {
        let mut args = vec!["add".to_string(), "-A".to_string()];
        args.extend(pathspec(keep_out));
        self.run_checked_owned(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked_owned(&self, args: &[String]) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(anyhow!(
                output.failure_summary(&format!("git {}", args.join(" ")))
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.limits.timeout, self.limits.output_limit_bytes)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Vcs for Git {
    fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    #[instrument(skip_all)]
    fn commit(&self, message: &str, keep_out: &[PathBuf]) -> Result<CommitOutcome> {
        self.add_all(keep_out)?;
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(CommitOutcome::NothingToCommit);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(CommitOutcome::Committed)
    }

    #[instrument(skip_all, fields(label))]
    fn shelve(&self, label: &str, keep_out: &[PathBuf]) -> Result<()> {
        let mut args = ["stash", "push", "--include-untracked", "-m", label]
            .map(str::to_string)
            .to_vec();
        args.extend(pathspec(keep_out));
        self.run_checked_owned(&args)?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, branch))]
    fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, branch))]
    fn integrate(&self, remote: &str, branch: &str) -> Result<IntegrateOutcome> {
        let before = self.head()?;
        let upstream = format!("{remote}/{branch}");
        let output = self.run(&["rebase", &upstream])?;
        if !output.success() {
            let summary = output.failure_summary(&format!("git rebase {upstream}"));
            warn!(%summary, "rebase failed, aborting");
            if let Err(err) = self.run_checked(&["rebase", "--abort"]) {
                warn!(err = %err, "git rebase --abort failed");
            }
            return Err(anyhow!(summary));
        }
        if self.head()? == before {
            return Ok(IntegrateOutcome::UpToDate);
        }
        Ok(IntegrateOutcome::Updated)
    }

    #[instrument(skip_all, fields(remote, branch))]
    fn publish(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:{branch}");
        self.run_checked(&["push", remote, &refspec])?;
        Ok(())
    }
}

/// `-- . :(exclude)<path>...`, or nothing when there is nothing to keep out.
fn pathspec(keep_out: &[PathBuf]) -> Vec<String> {
    if keep_out.is_empty() {
        return Vec::new();
    }
    let mut args = vec!["--".to_string(), ".".to_string()];
    args.extend(keep_out.iter().map(|path| format!(":(exclude){}", path.display())));
    args
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn clone_with_identity(root: &Path, name: &str) -> PathBuf {
        git(root, &["clone", "-q", "remote.git", name]);
        let dir = root.join(name);
        git(&dir, &["config", "user.email", "deploy@example.com"]);
        git(&dir, &["config", "user.name", "Deploy Test"]);
        git(&dir, &["config", "commit.gpgsign", "false"]);
        dir
    }

    /// Bare remote with one commit on `main` plus a working clone.
    fn remote_and_clone() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        git(temp.path(), &["init", "-q", "--bare", "-b", "main", "remote.git"]);
        let work = clone_with_identity(temp.path(), "work");
        fs::write(work.join("README.md"), "hello\n").expect("write");
        git(&work, &["add", "-A"]);
        git(&work, &["commit", "-q", "-m", "init"]);
        git(&work, &["push", "-q", "origin", "HEAD:main"]);
        (temp, work)
    }

    fn push_upstream_change(root: &Path, file: &str, contents: &str) {
        let other = clone_with_identity(root, "other");
        fs::write(other.join(file), contents).expect("write");
        git(&other, &["add", "-A"]);
        git(&other, &["commit", "-q", "-m", "upstream change"]);
        git(&other, &["push", "-q", "origin", "HEAD:main"]);
    }

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn clean_tree_has_nothing_to_commit() {
        let (_temp, work) = remote_and_clone();
        let git = Git::new(&work, CommandLimits::default());
        assert!(!git.has_uncommitted_changes().expect("status"));
        assert_eq!(
            git.commit("auto", &[]).expect("commit"),
            CommitOutcome::NothingToCommit
        );
    }

    #[test]
    fn commits_local_work_and_rebases_onto_remote() {
        let (temp, work) = remote_and_clone();
        push_upstream_change(temp.path(), "upstream.txt", "from remote\n");
        fs::write(work.join("local.txt"), "local\n").expect("write");

        let git = Git::new(&work, CommandLimits::default());
        assert!(git.has_uncommitted_changes().expect("status"));
        assert_eq!(
            git.commit("auto", &[]).expect("commit"),
            CommitOutcome::Committed
        );
        git.fetch("origin", "main").expect("fetch");
        assert_eq!(
            git.integrate("origin", "main").expect("integrate"),
            IntegrateOutcome::Updated
        );
        assert!(work.join("upstream.txt").exists());
        assert!(work.join("local.txt").exists());

        git.fetch("origin", "main").expect("fetch again");
        assert_eq!(
            git.integrate("origin", "main").expect("integrate again"),
            IntegrateOutcome::UpToDate
        );
    }

    #[test]
    fn conflicting_history_fails_and_restores_tree() {
        let (temp, work) = remote_and_clone();
        push_upstream_change(temp.path(), "README.md", "remote edit\n");
        fs::write(work.join("README.md"), "local edit\n").expect("write");

        let git = Git::new(&work, CommandLimits::default());
        git.commit("local edit", &[]).expect("commit");
        git.fetch("origin", "main").expect("fetch");
        let err = git.integrate("origin", "main").unwrap_err();
        assert!(err.to_string().contains("git rebase origin/main"));

        assert!(!work.join(".git/rebase-merge").exists());
        assert!(!work.join(".git/rebase-apply").exists());
        assert_eq!(
            fs::read_to_string(work.join("README.md")).expect("read"),
            "local edit\n"
        );
        assert!(!git.has_uncommitted_changes().expect("status"));
    }

    #[test]
    fn shelve_stashes_untracked_files() {
        let (_temp, work) = remote_and_clone();
        fs::write(work.join("scratch.py"), "x = 1\n").expect("write");
        let git = Git::new(&work, CommandLimits::default());
        git.shelve("redeploy save-point", &[]).expect("shelve");
        assert!(!work.join("scratch.py").exists());
        let list = git.run_capture(&["stash", "list"]).expect("stash list");
        assert!(list.contains("redeploy save-point"));
    }

    #[test]
    fn kept_out_paths_are_neither_committed_nor_shelved() {
        let (_temp, work) = remote_and_clone();
        fs::write(work.join(".env"), "TOKEN=secret\n").expect("write");
        fs::write(work.join("bot.py"), "x = 1\n").expect("write");
        let git = Git::new(&work, CommandLimits::default());
        let keep_out = [PathBuf::from(".env")];

        assert_eq!(
            git.commit("auto", &keep_out).expect("commit"),
            CommitOutcome::Committed
        );
        assert_eq!(
            git.commit("again", &keep_out).expect("commit"),
            CommitOutcome::NothingToCommit
        );
        let tracked = git.run_capture(&["ls-files"]).expect("ls-files");
        assert!(tracked.contains("bot.py"));
        assert!(!tracked.contains(".env"));

        fs::write(work.join("scratch.py"), "y = 2\n").expect("write");
        git.shelve("redeploy save-point", &keep_out).expect("shelve");
        assert!(!work.join("scratch.py").exists());
        assert!(work.join(".env").exists());
    }
}
