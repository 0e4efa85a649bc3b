//! Surfaced error categories with stable classifiers.
//!
//! Transient failures (probe timeouts, malformed probe replies, crashed
//! subprocesses with retries remaining, failed rescues) are handled locally
//! by the driver and checker and never reach this enum. What remains are the
//! categories a caller or script needs to branch on, so each carries a
//! machine-readable classifier string that the CLI prints alongside the
//! human message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The task document could not be reconciled by the validator.
    #[error("task document invalid: {0}")]
    TaskFormatInvalid(String),

    /// Dirty working tree, missing tasks file, failed provider health check.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The OS refused to create the child process.
    #[error("failed to spawn session subprocess: {0}")]
    SpawnFailed(String),

    /// Nonzero exit with no commits and no status transitions, retries exhausted.
    #[error("session subprocess crashed (exit code {exit_code:?}) after {attempts} attempt(s)")]
    SubprocessCrashed {
        exit_code: Option<i32>,
        attempts: u32,
    },

    /// The no-commit streak reached the configured limit.
    #[error("stalled: {streak} consecutive iterations without verified progress")]
    Stalled { streak: u32 },

    /// Start-time persistence failure; the subprocess was not spawned.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Write failure while rewriting a task document.
    #[error("filesystem write failed: {0}")]
    FsWrite(String),
}

impl RunnerError {
    /// Stable machine-readable classifier for scripts wrapping the CLI.
    pub fn classifier(&self) -> &'static str {
        match self {
            RunnerError::TaskFormatInvalid(_) => "task-format-invalid",
            RunnerError::PreconditionFailed(_) => "precondition-failed",
            RunnerError::SpawnFailed(_) => "spawn-failed",
            RunnerError::SubprocessCrashed { .. } => "subprocess-crashed",
            RunnerError::Stalled { .. } => "stalled",
            RunnerError::Persistence(_) => "persistence-error",
            RunnerError::FsWrite(_) => "fs-write-failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifiers_are_stable() {
        assert_eq!(
            RunnerError::Stalled { streak: 3 }.classifier(),
            "stalled"
        );
        assert_eq!(
            RunnerError::TaskFormatInvalid("x".to_string()).classifier(),
            "task-format-invalid"
        );
        assert_eq!(
            RunnerError::PreconditionFailed("x".to_string()).classifier(),
            "precondition-failed"
        );
    }
}
