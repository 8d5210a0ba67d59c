//! Deterministic, pure logic shared by the run orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod duration;
pub mod forbidden;
pub mod recurrence;
pub mod types;
