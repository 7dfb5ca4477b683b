//! Shared deterministic types for the deployment pipeline.
//!
//! These types define stable contracts between stages, the orchestrator and the
//! run report. They do not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome classification of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Ok,
    Warned,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Ok => "ok",
            StageStatus::Warned => "warned",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result returned by every stage.
///
/// `Failed` on a required stage aborts the run; `Failed` on an optional stage
/// and `Warned` on any stage let the run continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub message: String,
    /// True when re-running the deployment without operator action may succeed.
    pub retriable: bool,
}

impl StageResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Ok,
            message: message.into(),
            retriable: false,
        }
    }

    pub fn warned(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Warned,
            message: message.into(),
            retriable: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            message: message.into(),
            retriable: false,
        }
    }

    pub fn retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

/// Category of a required-stage failure. Each maps to its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Local and remote history could not be integrated.
    SyncDivergence,
    /// Source files still fail to parse under the strict policy.
    SyntaxFatal,
    /// Neither the manifest nor the fallback set could be installed.
    DependencyFatal,
    /// The managed process could not be brought Online.
    ProcessFatal,
    /// Stages that never abort the run.
    NonFatal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::SyncDivergence => "sync-divergence",
            FailureKind::SyntaxFatal => "syntax-fatal",
            FailureKind::DependencyFatal => "dependency-fatal",
            FailureKind::ProcessFatal => "process-fatal",
            FailureKind::NonFatal => "non-fatal",
        };
        f.write_str(s)
    }
}

/// Whether syntax failures block the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxPolicy {
    /// Any file that still fails after repair aborts the run.
    Strict,
    /// Failures are recorded as warnings and the run continues.
    #[default]
    Lenient,
}

/// Process state as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Unknown,
    Starting,
    Online,
    Crashed,
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObservedState::Unknown => "unknown",
            ObservedState::Starting => "starting",
            ObservedState::Online => "online",
            ObservedState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
}

/// How the supervisor should launch the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessDescriptor {
    /// Logical name; at most one instance with this name may run.
    pub name: String,
    /// Script or binary to launch, relative to the worktree.
    pub entrypoint: String,
    /// Interpreter the supervisor runs the entrypoint with.
    pub runtime: String,
}

impl Default for ProcessDescriptor {
    fn default() -> Self {
        Self {
            name: "trading-bot".to_string(),
            entrypoint: "main.py".to_string(),
            runtime: "python3".to_string(),
        }
    }
}

/// The worker this pipeline deploys, as last seen during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub name: String,
    pub entrypoint: String,
    pub runtime: String,
    pub desired: DesiredState,
    pub observed: ObservedState,
}

impl ManagedProcess {
    pub fn new(descriptor: &ProcessDescriptor, observed: ObservedState) -> Self {
        Self {
            name: descriptor.name.clone(),
            entrypoint: descriptor.entrypoint.clone(),
            runtime: descriptor.runtime.clone(),
            desired: DesiredState::Running,
            observed,
        }
    }
}
