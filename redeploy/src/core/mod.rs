//! Deterministic, pure logic shared by the deployment pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod indent;
pub mod report;
pub mod retry;
pub mod types;
