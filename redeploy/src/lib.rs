//! Self-healing deployment orchestrator for a long-running worker process.
//!
//! A run walks a fixed pipeline of stages against a working tree:
//! source sync, code normalization, syntax gate, dependency install,
//! environment validation, and process lifecycle. Each stage owns its own
//! retry and fallback rules; the orchestrator decides whether a failure aborts
//! the run and records everything in a [`core::report::RunReport`].
//!
//! - **[`core`]**: Pure logic (reports, retry schedules, text normalization).
//!   No I/O.
//! - **[`io`]**: Side-effecting adapters (git, package manager, syntax checker,
//!   process supervisor, filesystem). Each sits behind a trait so tests can
//!   substitute fakes.
//!
//! Stage modules implement [`stage::Stage`]; [`pipeline`] wires them together.

pub mod core;
pub mod dependencies;
pub mod environment;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod normalizer;
pub mod pipeline;
pub mod source_sync;
pub mod stage;
pub mod syntax_gate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
