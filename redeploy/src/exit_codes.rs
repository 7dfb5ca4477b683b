//! Stable exit codes for redeploy CLI commands.

/// Command succeeded; for `run`, the worker ended Online with no required-stage failure.
pub const OK: i32 = 0;
/// Invalid configuration, usage error, or an unexpected internal error.
pub const INVALID: i32 = 1;
/// Another run holds the worktree lock.
pub const ALREADY_RUNNING: i32 = 2;
/// The run was cancelled at a stage boundary.
pub const CANCELLED: i32 = 3;
/// Remote integration failed; local and remote history diverge.
pub const SYNC_DIVERGENCE: i32 = 10;
/// Source files still fail to parse under the strict policy.
pub const SYNTAX_FATAL: i32 = 11;
/// Neither the manifest nor the fallback package set could be installed.
pub const DEPENDENCY_FATAL: i32 = 12;
/// The managed process could not be confirmed Online.
pub const PROCESS_FATAL: i32 = 13;
