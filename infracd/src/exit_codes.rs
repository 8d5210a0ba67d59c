//! Process exit codes.

/// The run succeeded or was skipped by the recurrence policy.
pub const OK: i32 = 0;
/// Any fatal error, including a failed hook or metrics push after a successful run.
pub const FAILURE: i32 = 1;
