//! Commit rescue adapter.
//!
//! Rescue converts uncommitted session work into git commits. The command is
//! external and configured; the core only requires that on success at least
//! one commit exists since invocation, and it re-verifies that itself via
//! the git probes.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{info, warn};

use crate::io::process::run_command_with_timeout;

const RESCUE_TIMEOUT: Duration = Duration::from_secs(300);
const RESCUE_OUTPUT_LIMIT: usize = 262_144;

/// Outcome of a rescue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueOutcome {
    pub ok: bool,
    pub detail: String,
}

/// The external commit-rescue collaborator.
pub trait RescueRunner {
    fn rescue(&self, project: &Path, spec_name: &str) -> RescueOutcome;
}

/// Production rescue: runs the configured argv with the spec name appended.
///
/// An empty command disables rescue; every attempt then reports failure and
/// the checker falls through to its timeout path.
#[derive(Debug, Clone)]
pub struct CliRescueRunner {
    command: Vec<String>,
}

impl CliRescueRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl RescueRunner for CliRescueRunner {
    fn rescue(&self, project: &Path, spec_name: &str) -> RescueOutcome {
        let Some((program, args)) = self.command.split_first() else {
            return RescueOutcome {
                ok: false,
                detail: "no rescue command configured".to_string(),
            };
        };
        info!(spec_name, "running commit rescue");

        let mut cmd = Command::new(program);
        cmd.args(args).arg(spec_name).current_dir(project);
        let output = match run_command_with_timeout(cmd, None, RESCUE_TIMEOUT, RESCUE_OUTPUT_LIMIT)
        {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "rescue command failed to run");
                return RescueOutcome {
                    ok: false,
                    detail: format!("rescue failed to run: {err}"),
                };
            }
        };
        if output.timed_out {
            warn!("rescue command timed out");
            return RescueOutcome {
                ok: false,
                detail: format!("rescue timed out after {RESCUE_TIMEOUT:?}"),
            };
        }
        if output.status.success() {
            RescueOutcome {
                ok: true,
                detail: "rescue command succeeded".to_string(),
            }
        } else {
            warn!(exit_code = ?output.status.code(), "rescue command failed");
            RescueOutcome {
                ok: false,
                detail: format!(
                    "rescue exited with {:?}: {}",
                    output.status.code(),
                    output.stderr_text().trim()
                ),
            }
        }
    }
}
