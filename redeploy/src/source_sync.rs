//! SourceSync: bring the worktree up to date with the remote branch without
//! losing uncommitted local work.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info};

use crate::core::retry::RetryPolicy;
use crate::core::types::{FailureKind, StageResult};
use crate::io::clock::{Sleeper, retry_with_backoff};
use crate::io::git::{CommitOutcome, IntegrateOutcome, Vcs};
use crate::stage::{RunContext, Stage};

pub struct SourceSync<'a> {
    pub vcs: &'a dyn Vcs,
    pub remote: String,
    pub branch: String,
    pub publish: bool,
    /// Worktree-relative paths that are never committed or shelved.
    pub keep_out: Vec<PathBuf>,
    /// Retries for the fetch; integration itself is never retried.
    pub retry: RetryPolicy,
    pub sleeper: &'a dyn Sleeper,
}

/// What happened to uncommitted local work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalWork {
    Clean,
    Committed,
    Shelved,
}

impl SourceSync<'_> {
    fn save_local_work(&self, ctx: &mut RunContext) -> Result<LocalWork, String> {
        let dirty = self
            .vcs
            .has_uncommitted_changes()
            .map_err(|err| format!("read worktree status: {err:#}"))?;
        if !dirty {
            return Ok(LocalWork::Clean);
        }

        let message = format!("redeploy: save local changes before {}", ctx.run_id);
        let commit_err = match self.vcs.commit(&message, &self.keep_out) {
            Ok(CommitOutcome::Committed) => {
                ctx.record_fix("committed uncommitted local changes");
                return Ok(LocalWork::Committed);
            }
            Ok(CommitOutcome::NothingToCommit) => {
                debug!("nothing to commit");
                return Ok(LocalWork::Clean);
            }
            Err(err) => err,
        };

        let label = format!("redeploy save-point {}", ctx.run_id);
        match self.vcs.shelve(&label, &self.keep_out) {
            Ok(()) => {
                ctx.record_fix(format!("shelved local changes as '{label}'"));
                ctx.warn(format!(
                    "auto-commit failed ({commit_err:#}); local changes shelved as '{label}'"
                ));
                Ok(LocalWork::Shelved)
            }
            Err(shelve_err) => Err(format!(
                "could not save local changes: commit failed ({commit_err:#}), \
                 shelve failed ({shelve_err:#})"
            )),
        }
    }
}

impl Stage for SourceSync<'_> {
    fn name(&self) -> &'static str {
        "source_sync"
    }

    fn required(&self) -> bool {
        true
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::SyncDivergence
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageResult> {
        let local = match self.save_local_work(ctx) {
            Ok(local) => local,
            Err(message) => return Ok(StageResult::failed(message)),
        };

        if let Err(err) = retry_with_backoff(&self.retry, self.sleeper, "fetch", || {
            self.vcs.fetch(&self.remote, &self.branch)
        }) {
            return Ok(StageResult::failed(format!(
                "fetch {}/{} failed after {} attempt(s): {err:#}",
                self.remote,
                self.branch,
                self.retry.attempts()
            ))
            .retriable(true));
        }

        let integrated = match self.vcs.integrate(&self.remote, &self.branch) {
            Ok(outcome) => outcome,
            Err(err) => {
                return Ok(StageResult::failed(format!(
                    "divergence: local history cannot be rebased onto {}/{} ({err:#}); \
                     resolve the conflict manually",
                    self.remote, self.branch
                )));
            }
        };

        let mut publish_failed = false;
        if self.publish && local == LocalWork::Committed {
            if let Err(err) = self.vcs.publish(&self.remote, &self.branch) {
                ctx.warn(format!("publish to {}/{} failed: {err:#}", self.remote, self.branch));
                publish_failed = true;
            }
        }

        let mut message = match integrated {
            IntegrateOutcome::UpToDate => {
                format!("already up to date with {}/{}", self.remote, self.branch)
            }
            IntegrateOutcome::Updated => {
                format!("rebased onto {}/{}", self.remote, self.branch)
            }
        };
        match local {
            LocalWork::Clean => {}
            LocalWork::Committed => message.push_str("; local changes committed"),
            LocalWork::Shelved => message.push_str("; local changes shelved"),
        }
        info!(%message, "source synchronized");

        if local == LocalWork::Shelved || publish_failed {
            return Ok(StageResult::warned(message));
        }
        Ok(StageResult::ok(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageStatus;
    use crate::test_support::{FakeVcs, RecordingSleeper};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn stage<'a>(vcs: &'a FakeVcs, sleeper: &'a RecordingSleeper) -> SourceSync<'a> {
        SourceSync {
            vcs,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            publish: false,
            keep_out: vec![PathBuf::from(".env")],
            retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(4)),
            sleeper,
        }
    }

    fn ctx() -> RunContext {
        RunContext::new("run-1", "/srv/bot", BTreeMap::new())
    }

    #[test]
    fn nothing_to_sync_is_ok_every_time() {
        let vcs = FakeVcs::new();
        let sleeper = RecordingSleeper::default();
        let sync = stage(&vcs, &sleeper);
        let mut ctx = ctx();
        for _ in 0..2 {
            let result = sync.run(&mut ctx).expect("run");
            assert_eq!(result.status, StageStatus::Ok);
            assert!(result.message.contains("already up to date"));
        }
        assert!(!vcs.calls().iter().any(|c| c == "commit"));
    }

    #[test]
    fn dirty_tree_is_committed_then_rebased() {
        let vcs = FakeVcs::new().dirty().behind();
        let sleeper = RecordingSleeper::default();
        let mut ctx = ctx();
        let result = stage(&vcs, &sleeper).run(&mut ctx).expect("run");
        assert_eq!(result.status, StageStatus::Ok);
        assert!(result.message.contains("rebased onto origin/main"));
        assert_eq!(vcs.calls(), vec!["status", "commit", "fetch", "integrate"]);
        assert_eq!(ctx.applied_fixes, vec!["committed uncommitted local changes"]);
        assert_eq!(vcs.kept_out(), vec![PathBuf::from(".env")]);
    }

    #[test]
    fn failed_commit_falls_back_to_shelving() {
        let vcs = FakeVcs::new().dirty().failing_commit();
        let sleeper = RecordingSleeper::default();
        let mut ctx = ctx();
        let result = stage(&vcs, &sleeper).run(&mut ctx).expect("run");
        assert_eq!(result.status, StageStatus::Warned);
        assert!(vcs.calls().contains(&"shelve".to_string()));
        assert!(!vcs.is_dirty());
        assert!(ctx.warnings[0].contains("shelved"));
    }

    #[test]
    fn commit_and_shelve_failure_is_fatal_before_fetch() {
        let vcs = FakeVcs::new().dirty().failing_commit().failing_shelve();
        let sleeper = RecordingSleeper::default();
        let result = stage(&vcs, &sleeper).run(&mut ctx()).expect("run");
        assert_eq!(result.status, StageStatus::Failed);
        assert!(!vcs.calls().contains(&"fetch".to_string()));
    }

    #[test]
    fn divergence_is_fatal_and_not_retried() {
        let vcs = FakeVcs::new().diverged();
        let sleeper = RecordingSleeper::default();
        let result = stage(&vcs, &sleeper).run(&mut ctx()).expect("run");
        assert_eq!(result.status, StageStatus::Failed);
        assert!(!result.retriable);
        assert!(result.message.starts_with("divergence"));
        let integrations = vcs.calls().iter().filter(|c| *c == "integrate").count();
        assert_eq!(integrations, 1);
    }

    #[test]
    fn transient_fetch_failures_are_retried_with_backoff() {
        let vcs = FakeVcs::new().fetch_failures(2);
        let sleeper = RecordingSleeper::default();
        let result = stage(&vcs, &sleeper).run(&mut ctx()).expect("run");
        assert_eq!(result.status, StageStatus::Ok);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn exhausted_fetch_retries_fail_as_retriable() {
        let vcs = FakeVcs::new().fetch_failures(10);
        let sleeper = RecordingSleeper::default();
        let result = stage(&vcs, &sleeper).run(&mut ctx()).expect("run");
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.retriable);
        assert!(result.message.contains("after 3 attempt(s)"));
    }

    #[test]
    fn publish_failure_only_warns() {
        let vcs = FakeVcs::new().dirty().failing_publish();
        let sleeper = RecordingSleeper::default();
        let mut sync = stage(&vcs, &sleeper);
        sync.publish = true;
        let mut ctx = ctx();
        let result = sync.run(&mut ctx).expect("run");
        assert_eq!(result.status, StageStatus::Warned);
        assert!(ctx.warnings[0].contains("publish"));
    }
}
