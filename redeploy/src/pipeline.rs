//! Orchestration for a single `redeploy run`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, info_span, warn};

use crate::core::report::{ReportBuilder, RunOutcome, RunReport};
use crate::core::types::{StageResult, StageStatus};
use crate::dependencies::DependencyInstaller;
use crate::environment::EnvironmentValidator;
use crate::io::cancel::CancelToken;
use crate::io::clock::Sleeper;
use crate::io::config::DeployConfig;
use crate::io::formatter::Formatter;
use crate::io::git::Vcs;
use crate::io::lock::RunLock;
use crate::io::packages::PackageInstaller;
use crate::io::state::ensure_state_dir;
use crate::io::supervisor::Supervisor;
use crate::io::syntax::SyntaxChecker;
use crate::lifecycle::ProcessLifecycleManager;
use crate::normalizer::CodeNormalizer;
use crate::source_sync::SourceSync;
use crate::stage::{RunContext, Stage};
use crate::syntax_gate::SyntaxGate;

/// Adapters the stages run against.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    pub vcs: &'a dyn Vcs,
    pub packages: &'a dyn PackageInstaller,
    pub formatter: &'a dyn Formatter,
    pub syntax: &'a dyn SyntaxChecker,
    pub supervisor: &'a dyn Supervisor,
    pub sleeper: &'a dyn Sleeper,
}

/// Runs stages strictly in order, checking for cancellation between them.
pub struct Orchestrator<'a> {
    stages: Vec<Box<dyn Stage + 'a>>,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(stages: Vec<Box<dyn Stage + 'a>>, cancel: CancelToken) -> Self {
        Self { stages, cancel }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Execute every stage and produce the final report.
    ///
    /// A `Failed` result from a required stage stops the run; failures of
    /// non-required stages are recorded as warnings and the run continues.
    pub fn run(&self, mut ctx: RunContext, started_at: &str) -> RunReport {
        let mut report = ReportBuilder::new(ctx.run_id.clone(), started_at);
        let mut outcome = RunOutcome::Completed;

        for stage in &self.stages {
            let name = stage.name();
            if self.cancel.is_cancelled() {
                info!(stage = name, "cancellation requested; stopping before stage");
                outcome = RunOutcome::Cancelled {
                    before_stage: name.to_string(),
                };
                break;
            }

            let span = info_span!("stage", name);
            let _enter = span.enter();
            let started = Instant::now();
            let result = match stage.run(&mut ctx) {
                Ok(result) => result,
                Err(err) => StageResult::failed(format!("{err:#}")),
            };
            report.record(name, &result, started.elapsed());

            match result.status {
                StageStatus::Ok => info!(message = %result.message, "stage ok"),
                StageStatus::Warned => warn!(message = %result.message, "stage warned"),
                StageStatus::Failed => warn!(
                    message = %result.message,
                    required = stage.required(),
                    "stage failed"
                ),
            }

            if result.is_failed() {
                if stage.required() {
                    outcome = RunOutcome::Aborted {
                        stage: name.to_string(),
                        failure: stage.failure_kind(),
                    };
                    break;
                }
                ctx.warn(format!("{name} failed: {}", result.message));
            }
        }

        report.finish(outcome, ctx.warnings, ctx.applied_fixes, ctx.process)
    }
}

/// The six deployment stages in their fixed order.
pub fn deployment_stages<'a>(
    config: &DeployConfig,
    backends: Backends<'a>,
) -> Vec<Box<dyn Stage + 'a>> {
    let env_file = config.resolve(&config.environment.file);
    // credentials stay local even when the repository does not ignore them
    let keep_out = env_file
        .strip_prefix(&config.worktree)
        .map(Path::to_path_buf)
        .into_iter()
        .collect();
    vec![
        Box::new(SourceSync {
            vcs: backends.vcs,
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            publish: config.publish,
            keep_out,
            retry: config.network.retry,
            sleeper: backends.sleeper,
        }),
        Box::new(CodeNormalizer {
            formatter: backends.formatter,
            indent_width: config.indent_width,
            extensions: config.normalize_extensions.clone(),
            excluded_dirs: config.excluded_dirs.clone(),
        }),
        Box::new(SyntaxGate {
            checker: backends.syntax,
            formatter: backends.formatter,
            policy: config.syntax_policy,
            indent_width: config.indent_width,
            extensions: config.syntax_extensions.clone(),
            excluded_dirs: config.excluded_dirs.clone(),
        }),
        Box::new(DependencyInstaller {
            installer: backends.packages,
            manifest: config.resolve(&config.dependencies.manifest),
            fallback: config.dependencies.fallback.clone(),
            retry: config.network.retry,
            sleeper: backends.sleeper,
        }),
        Box::new(EnvironmentValidator {
            file: env_file,
            required_keys: config.environment.required_keys.clone(),
        }),
        Box::new(ProcessLifecycleManager {
            supervisor: backends.supervisor,
            process: config.process.clone(),
            health: config.health,
            sleeper: backends.sleeper,
            persist_state: config.supervisor.persist_state,
            enable_on_boot: config.supervisor.enable_on_boot,
        }),
    ]
}

/// Run a full deployment in `config.worktree`.
///
/// Fails fast with [`crate::io::lock::AlreadyRunningError`] when another run
/// holds the worktree lock; nothing in the worktree is touched in that case.
pub fn run_deployment(
    config: &DeployConfig,
    backends: Backends<'_>,
    cancel: CancelToken,
    env: BTreeMap<String, String>,
) -> Result<RunReport> {
    let paths = ensure_state_dir(&config.worktree)?;
    let lock = RunLock::acquire(&paths.lock_path)?;
    debug!(lock = %lock.path().display(), "holding run lock");
    cancel.clear_sentinel()?;

    let now = Utc::now();
    let run_id = format!("run-{}", now.format("%Y%m%dT%H%M%S%.3fZ"));
    let started_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    info!(run_id = %run_id, worktree = %config.worktree.display(), "run started");

    let ctx = RunContext::new(run_id, &config.worktree, env);
    let orchestrator = Orchestrator::new(deployment_stages(config, backends), cancel);
    let report = orchestrator.run(ctx, &started_at);
    drop(lock);

    info!(
        run_id = %report.run_id(),
        status = %report.status(),
        exit_code = report.exit_code(),
        "run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use anyhow::anyhow;
    use std::cell::RefCell;

    struct Scripted<'a> {
        name: &'static str,
        required: bool,
        result: Result<StageResult, &'static str>,
        log: &'a RefCell<Vec<&'static str>>,
        cancel_after: Option<&'a CancelToken>,
    }

    impl Stage for Scripted<'_> {
        fn name(&self) -> &'static str {
            self.name
        }

        fn required(&self) -> bool {
            self.required
        }

        fn failure_kind(&self) -> FailureKind {
            FailureKind::DependencyFatal
        }

        fn run(&self, _ctx: &mut RunContext) -> Result<StageResult> {
            self.log.borrow_mut().push(self.name);
            if let Some(token) = self.cancel_after {
                token.cancel();
            }
            self.result.clone().map_err(|msg| anyhow!(msg))
        }
    }

    fn scripted<'a>(
        name: &'static str,
        required: bool,
        result: Result<StageResult, &'static str>,
        log: &'a RefCell<Vec<&'static str>>,
    ) -> Box<dyn Stage + 'a> {
        Box::new(Scripted {
            name,
            required,
            result,
            log,
            cancel_after: None,
        })
    }

    fn ctx() -> RunContext {
        RunContext::new("run-1", "/srv/bot", BTreeMap::new())
    }

    #[test]
    fn runs_every_stage_in_order() {
        let log = RefCell::new(Vec::new());
        let orchestrator = Orchestrator::new(
            vec![
                scripted("a", true, Ok(StageResult::ok("fine")), &log),
                scripted("b", false, Ok(StageResult::warned("meh")), &log),
                scripted("c", true, Ok(StageResult::ok("fine")), &log),
            ],
            CancelToken::new(),
        );

        let report = orchestrator.run(ctx(), "2026-01-01T00:00:00Z");

        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(report.outcome(), &RunOutcome::Completed);
        assert_eq!(report.status(), StageStatus::Warned);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn required_failure_skips_remaining_stages() {
        let log = RefCell::new(Vec::new());
        let orchestrator = Orchestrator::new(
            vec![
                scripted("a", true, Ok(StageResult::failed("broken")), &log),
                scripted("b", true, Ok(StageResult::ok("fine")), &log),
            ],
            CancelToken::new(),
        );

        let report = orchestrator.run(ctx(), "now");

        assert_eq!(*log.borrow(), vec!["a"]);
        assert_eq!(report.stages().len(), 1);
        assert_eq!(
            report.outcome(),
            &RunOutcome::Aborted {
                stage: "a".to_string(),
                failure: FailureKind::DependencyFatal
            }
        );
    }

    #[test]
    fn optional_failure_becomes_a_warning() {
        let log = RefCell::new(Vec::new());
        let orchestrator = Orchestrator::new(
            vec![
                scripted("a", false, Err("disk on fire"), &log),
                scripted("b", true, Ok(StageResult::ok("fine")), &log),
            ],
            CancelToken::new(),
        );

        let report = orchestrator.run(ctx(), "now");

        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert_eq!(report.stage("a").map(|s| s.status), Some(StageStatus::Failed));
        assert_eq!(report.warnings(), ["a failed: disk on fire"]);
        assert_eq!(report.outcome(), &RunOutcome::Completed);
    }

    #[test]
    fn cancellation_is_honoured_at_the_next_boundary() {
        let log = RefCell::new(Vec::new());
        let cancel = CancelToken::new();
        let first = Box::new(Scripted {
            name: "a",
            required: true,
            result: Ok(StageResult::ok("fine")),
            log: &log,
            cancel_after: Some(&cancel),
        });
        let orchestrator = Orchestrator::new(
            vec![first, scripted("b", true, Ok(StageResult::ok("fine")), &log)],
            cancel.clone(),
        );

        let report = orchestrator.run(ctx(), "now");

        assert_eq!(*log.borrow(), vec!["a"]);
        assert_eq!(
            report.outcome(),
            &RunOutcome::Cancelled {
                before_stage: "b".to_string()
            }
        );
        assert_eq!(report.exit_code(), crate::exit_codes::CANCELLED);
    }

    #[test]
    fn deployment_stages_have_fixed_order() {
        let config = DeployConfig::default();
        let vcs = crate::test_support::FakeVcs::new();
        let packages = crate::test_support::FakePackages::default();
        let syntax = crate::test_support::FakeSyntaxChecker::default();
        let supervisor = crate::test_support::FakeSupervisor::absent();
        let sleeper = crate::test_support::RecordingSleeper::default();
        let backends = Backends {
            vcs: &vcs,
            packages: &packages,
            formatter: &crate::io::formatter::IndentFormatter,
            syntax: &syntax,
            supervisor: &supervisor,
            sleeper: &sleeper,
        };
        let orchestrator =
            Orchestrator::new(deployment_stages(&config, backends), CancelToken::new());
        assert_eq!(
            orchestrator.stage_names(),
            vec![
                "source_sync",
                "code_normalizer",
                "syntax_gate",
                "dependency_installer",
                "environment_validator",
                "process_lifecycle"
            ]
        );
    }
}
