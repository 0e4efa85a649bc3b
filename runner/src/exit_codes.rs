//! Stable exit codes for spec-runner CLI commands.

/// Command succeeded; for `run`, the spec reached `IterationDone`.
pub const OK: i32 = 0;
/// Command failed due to invalid arguments, config, or an unexpected error.
pub const INVALID: i32 = 1;
/// `run` halted because the no-commit streak reached the configured limit.
pub const STALLED: i32 = 3;
/// `run` aborted because the task document could not be reconciled.
pub const TASK_FORMAT_INVALID: i32 = 4;
/// `run` aborted before spawning anything (dirty tree, missing tasks, provider).
pub const PRECONDITION_FAILED: i32 = 5;
