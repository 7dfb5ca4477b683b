//! Append-only audit trail of a deployment run.

use std::time::Duration;

use serde::Serialize;

use crate::core::types::{FailureKind, ManagedProcess, StageResult, StageStatus};
use crate::exit_codes;

/// One executed stage, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub message: String,
    pub retriable: bool,
    pub duration_ms: u64,
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage ran and no required stage failed.
    Completed,
    /// A required stage failed; later stages were skipped.
    Aborted { stage: String, failure: FailureKind },
    /// An abort was requested; `before_stage` is the first stage not started.
    Cancelled { before_stage: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => exit_codes::OK,
            RunOutcome::Cancelled { .. } => exit_codes::CANCELLED,
            RunOutcome::Aborted { failure, .. } => match failure {
                FailureKind::SyncDivergence => exit_codes::SYNC_DIVERGENCE,
                FailureKind::SyntaxFatal => exit_codes::SYNTAX_FATAL,
                FailureKind::DependencyFatal => exit_codes::DEPENDENCY_FATAL,
                FailureKind::ProcessFatal => exit_codes::PROCESS_FATAL,
                FailureKind::NonFatal => exit_codes::INVALID,
            },
        }
    }
}

/// Collects stage records while a run is in flight.
///
/// Records can only be appended; `finish` consumes the builder so the report
/// cannot change once the run has ended.
#[derive(Debug)]
pub struct ReportBuilder {
    run_id: String,
    started_at: String,
    stages: Vec<StageRecord>,
}

impl ReportBuilder {
    pub fn new(run_id: impl Into<String>, started_at: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: started_at.into(),
            stages: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: &str, result: &StageResult, duration: Duration) {
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            status: result.status,
            message: result.message.clone(),
            retriable: result.retriable,
            duration_ms: duration.as_millis() as u64,
        });
    }

    pub fn finish(
        self,
        outcome: RunOutcome,
        warnings: Vec<String>,
        applied_fixes: Vec<String>,
        process: Option<ManagedProcess>,
    ) -> RunReport {
        let exit_code = outcome.exit_code();
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            stages: self.stages,
            warnings,
            applied_fixes,
            process,
            outcome,
            exit_code,
        }
    }
}

/// Final, immutable report of a deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    run_id: String,
    started_at: String,
    stages: Vec<StageRecord>,
    warnings: Vec<String>,
    applied_fixes: Vec<String>,
    process: Option<ManagedProcess>,
    outcome: RunOutcome,
    exit_code: i32,
}

impl RunReport {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == name)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn applied_fixes(&self) -> &[String] {
        &self.applied_fixes
    }

    pub fn process(&self) -> Option<&ManagedProcess> {
        self.process.as_ref()
    }

    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Overall status: the worst status among executed stages, or `Failed`
    /// when the run did not complete.
    pub fn status(&self) -> StageStatus {
        if self.outcome != RunOutcome::Completed {
            return StageStatus::Failed;
        }
        if self
            .stages
            .iter()
            .any(|record| record.status != StageStatus::Ok)
        {
            return StageStatus::Warned;
        }
        StageStatus::Ok
    }

    /// Human-readable multi-line summary for operators.
    pub fn render_text(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&format!(
            "run {} started {}: {}\n",
            self.run_id,
            self.started_at,
            self.status()
        ));
        for record in &self.stages {
            buf.push_str(&format!(
                "  [{:<6}] {:<22} {:>6}ms  {}\n",
                record.status.to_string(),
                record.stage,
                record.duration_ms,
                record.message
            ));
        }
        match &self.outcome {
            RunOutcome::Completed => {}
            RunOutcome::Aborted { stage, failure } => {
                buf.push_str(&format!("aborted at {stage} ({failure})\n"));
            }
            RunOutcome::Cancelled { before_stage } => {
                buf.push_str(&format!("cancelled before {before_stage}\n"));
            }
        }
        if let Some(process) = &self.process {
            buf.push_str(&format!(
                "process {}: {}\n",
                process.name, process.observed
            ));
        }
        for fix in &self.applied_fixes {
            buf.push_str(&format!("fix: {fix}\n"));
        }
        for warning in &self.warnings {
            buf.push_str(&format!("warning: {warning}\n"));
        }
        buf.push_str(&format!("exit code {}\n", self.exit_code));
        buf
    }
}
