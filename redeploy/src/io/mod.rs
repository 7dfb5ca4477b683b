//! Side-effecting adapters: filesystem, git, packages, supervisor, processes.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod env_file;
pub mod formatter;
pub mod git;
pub mod lock;
pub mod packages;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod syntax;
pub mod walk;
