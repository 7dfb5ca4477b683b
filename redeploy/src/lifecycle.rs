//! ProcessLifecycleManager: keep exactly one supervised instance of the worker
//! running and healthy.

use anyhow::Result;
use tracing::{debug, info};

use crate::core::retry::RetryPolicy;
use crate::core::types::{
    FailureKind, ManagedProcess, ObservedState, ProcessDescriptor, StageResult,
};
use crate::io::clock::Sleeper;
use crate::io::supervisor::{LogStream, Supervisor};
use crate::stage::{RunContext, Stage};

/// Error-stream lines attached to a process-fatal result.
const FAILURE_LOG_LINES: usize = 20;

pub struct ProcessLifecycleManager<'a> {
    pub supervisor: &'a dyn Supervisor,
    pub process: ProcessDescriptor,
    /// Health polling schedule after a start or restart.
    pub health: RetryPolicy,
    pub sleeper: &'a dyn Sleeper,
    pub persist_state: bool,
    pub enable_on_boot: bool,
}

impl ProcessLifecycleManager<'_> {
    fn observe(&self, ctx: &mut RunContext) -> Result<ObservedState> {
        let state = self.supervisor.describe(&self.process.name)?;
        match ctx.process.as_mut() {
            Some(process) => process.observed = state,
            None => ctx.process = Some(ManagedProcess::new(&self.process, state)),
        }
        Ok(state)
    }

    /// Establish whether an instance is registered, retrying failed queries on
    /// the health schedule. `Unknown` here always means "not registered".
    fn presence(&self, ctx: &mut RunContext) -> Result<ObservedState, String> {
        let mut retry = 0;
        loop {
            match self.observe(ctx) {
                Ok(state) => return Ok(state),
                Err(err) if retry >= self.health.max_retries => {
                    return Err(format!(
                        "could not determine whether {} is registered: {err:#}",
                        self.process.name
                    ));
                }
                Err(err) => {
                    debug!(err = %format!("{err:#}"), retry, "describe failed; retrying");
                }
            }
            self.sleeper.sleep(self.health.delay_for_retry(retry));
            retry += 1;
        }
    }

    /// Poll until Online or the health schedule is exhausted; returns the last state seen.
    fn await_online(&self, ctx: &mut RunContext) -> ObservedState {
        let mut retry = 0;
        loop {
            let state = self.observe(ctx).unwrap_or_else(|err| {
                debug!(err = %format!("{err:#}"), "health poll failed");
                ObservedState::Unknown
            });
            if state == ObservedState::Online || retry >= self.health.max_retries {
                return state;
            }
            self.sleeper.sleep(self.health.delay_for_retry(retry));
            retry += 1;
        }
    }

    /// Stop and delete any instance still registered under the process name.
    fn remove_existing(&self, ctx: &mut RunContext) -> Result<(), String> {
        let name = &self.process.name;
        if self.presence(ctx)? == ObservedState::Unknown {
            return Ok(());
        }
        if let Err(err) = self.supervisor.stop(name) {
            debug!(err = %format!("{err:#}"), "stop failed; deleting anyway");
        }
        self.supervisor
            .delete(name)
            .map_err(|err| format!("could not remove existing instance {name}: {err:#}"))?;
        ctx.record_fix(format!("removed stale instance {name}"));
        Ok(())
    }

    fn restart_existing(&self, ctx: &mut RunContext) -> bool {
        let name = &self.process.name;
        if let Err(err) = self.supervisor.restart(name) {
            ctx.warn(format!("restart of {name} failed: {err:#}; starting fresh"));
            return false;
        }
        let state = self.await_online(ctx);
        if state == ObservedState::Online {
            return true;
        }
        ctx.warn(format!(
            "{name} did not come online after restart (last state: {state}); starting fresh"
        ));
        false
    }

    fn start_fresh(&self, ctx: &mut RunContext) -> Result<ObservedState, String> {
        self.remove_existing(ctx)?;
        self.supervisor
            .start(&self.process)
            .map_err(|err| format!("start of {} failed: {err:#}", self.process.name))?;
        Ok(self.await_online(ctx))
    }

    fn failure(&self, reason: String) -> StageResult {
        let mut message = reason;
        match self
            .supervisor
            .tail_logs(&self.process.name, FAILURE_LOG_LINES, LogStream::Err)
        {
            Ok(lines) if !lines.is_empty() => {
                message.push_str("\nrecent errors:");
                for line in lines {
                    message.push_str("\n  ");
                    message.push_str(&line);
                }
            }
            Ok(_) => {}
            Err(err) => debug!(err = %format!("{err:#}"), "could not read logs"),
        }
        StageResult::failed(message)
    }

    /// Post-start bookkeeping; failures here never affect the process itself.
    fn persist(&self, ctx: &mut RunContext) -> bool {
        let mut clean = true;
        if self.persist_state
            && let Err(err) = self.supervisor.persist_state()
        {
            ctx.warn(format!("saving supervisor state failed: {err:#}"));
            clean = false;
        }
        if self.enable_on_boot
            && let Err(err) = self.supervisor.enable_on_boot()
        {
            ctx.warn(format!("enabling start on boot failed: {err:#}"));
            clean = false;
        }
        clean
    }

    /// Restart the existing instance, or start a fresh one, and wait for it to be Online.
    pub fn ensure_running(&self, ctx: &mut RunContext) -> StageResult {
        let name = self.process.name.clone();
        let initial = match self.presence(ctx) {
            Ok(state) => state,
            Err(reason) => return StageResult::failed(reason),
        };
        info!(
            process = %name,
            state = %initial,
            health_budget_ms = self.health.total_max_wait().as_millis() as u64,
            "ensuring process is running"
        );

        let mut recovered = false;
        let how = if initial != ObservedState::Unknown && self.restart_existing(ctx) {
            "restarted"
        } else {
            recovered = initial != ObservedState::Unknown;
            match self.start_fresh(ctx) {
                Ok(ObservedState::Online) => "started",
                Ok(state) => {
                    return self.failure(format!(
                        "{name} did not reach online within {} health check(s) \
                         (last state: {state})",
                        self.health.attempts()
                    ));
                }
                Err(reason) => return self.failure(reason),
            }
        };

        let message = format!("{name} {how} and online");
        if self.persist(ctx) && !recovered {
            StageResult::ok(message)
        } else {
            StageResult::warned(message)
        }
    }
}

impl Stage for ProcessLifecycleManager<'_> {
    fn name(&self) -> &'static str {
        "process_lifecycle"
    }

    fn required(&self) -> bool {
        true
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::ProcessFatal
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageResult> {
        Ok(self.ensure_running(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageStatus;
    use crate::test_support::{FakeSupervisor, RecordingSleeper};
    use ObservedState::{Crashed, Online, Starting};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn manager<'a>(
        supervisor: &'a FakeSupervisor,
        sleeper: &'a RecordingSleeper,
    ) -> ProcessLifecycleManager<'a> {
        ProcessLifecycleManager {
            supervisor,
            process: ProcessDescriptor::default(),
            health: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(400)),
            sleeper,
            persist_state: true,
            enable_on_boot: false,
        }
    }

    fn ctx() -> RunContext {
        RunContext::new("run-1", "/srv/bot", BTreeMap::new())
    }

    #[test]
    fn existing_instance_is_restarted() {
        let supervisor = FakeSupervisor::existing(Online).on_restart(vec![Starting, Online]);
        let sleeper = RecordingSleeper::default();
        let mut ctx = ctx();

        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx);

        assert_eq!(result.status, StageStatus::Ok, "{}", result.message);
        assert_eq!(supervisor.calls(), vec!["restart", "persist"]);
        assert_eq!(ctx.process.as_ref().map(|p| p.observed), Some(Online));
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn absent_instance_is_started_fresh() {
        let supervisor = FakeSupervisor::absent().on_start(vec![Starting, Starting, Online]);
        let sleeper = RecordingSleeper::default();

        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx());

        assert_eq!(result.status, StageStatus::Ok, "{}", result.message);
        assert_eq!(supervisor.calls(), vec!["start", "persist"]);
        assert_eq!(supervisor.peak_instances(), 1);
    }

    #[test]
    fn failed_restart_recovers_with_single_fresh_instance() {
        let supervisor = FakeSupervisor::existing(Crashed)
            .failing_restart()
            .on_start(vec![Online]);
        let sleeper = RecordingSleeper::default();
        let mut ctx = ctx();

        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx);

        assert_eq!(result.status, StageStatus::Warned, "{}", result.message);
        assert_eq!(
            supervisor.calls(),
            vec!["restart", "stop", "delete", "start", "persist"]
        );
        assert_eq!(supervisor.peak_instances(), 1);
        assert_eq!(ctx.applied_fixes, vec!["removed stale instance trading-bot"]);
    }

    #[test]
    fn never_online_is_fatal_with_error_logs() {
        let supervisor = FakeSupervisor::absent().on_start(vec![Crashed]);
        let sleeper = RecordingSleeper::default();

        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx());

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.message.contains("within 4 health check(s)"));
        assert!(result.message.contains("recent errors:"));
        assert_eq!(
            sleeper.total(),
            Duration::from_millis(100 + 200 + 400)
        );
    }

    #[test]
    fn start_failure_is_fatal() {
        let supervisor = FakeSupervisor::absent().failing_start();
        let sleeper = RecordingSleeper::default();
        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx());
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.message.starts_with("start of trading-bot failed"));
    }

    #[test]
    fn transient_describe_failure_still_restarts_the_single_instance() {
        let supervisor = FakeSupervisor::existing(Online)
            .failing_describe(2)
            .on_restart(vec![Online]);
        let sleeper = RecordingSleeper::default();

        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx());

        assert_eq!(result.status, StageStatus::Ok, "{}", result.message);
        assert_eq!(supervisor.calls(), vec!["restart", "persist"]);
        assert_eq!(supervisor.peak_instances(), 1);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn unknown_presence_is_fatal_without_starting_a_second_instance() {
        let supervisor = FakeSupervisor::existing(Online).failing_describe(10);
        let sleeper = RecordingSleeper::default();

        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx());

        assert_eq!(result.status, StageStatus::Failed);
        assert!(
            result.message.starts_with("could not determine whether trading-bot is registered"),
            "{}",
            result.message
        );
        assert!(supervisor.calls().is_empty());
        assert_eq!(supervisor.peak_instances(), 1);
        assert_eq!(supervisor.current(), Online);
    }

    #[test]
    fn removal_without_confirmed_presence_touches_nothing() {
        let supervisor = FakeSupervisor::existing(Crashed).failing_describe(10);
        let sleeper = RecordingSleeper::default();

        let removed = manager(&supervisor, &sleeper).remove_existing(&mut ctx());

        assert!(removed.is_err());
        assert!(supervisor.calls().is_empty());
        assert_eq!(supervisor.peak_instances(), 1);
    }

    #[test]
    fn persist_failure_only_warns() {
        let supervisor = FakeSupervisor::absent()
            .on_start(vec![Online])
            .failing_persist();
        let sleeper = RecordingSleeper::default();
        let mut ctx = ctx();
        let result = manager(&supervisor, &sleeper).ensure_running(&mut ctx);
        assert_eq!(result.status, StageStatus::Warned);
        assert!(ctx.warnings[0].contains("saving supervisor state"));
    }
}
