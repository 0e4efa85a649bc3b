//! Shared deterministic types for the supervision core.
//!
//! These types define stable contracts between components. They must not
//! depend on external state or I/O and must remain deterministic across runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a single checkbox task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// The mark character this status renders as inside `[ ]`.
    pub fn mark(self) -> char {
        match self {
            TaskStatus::Pending => ' ',
            TaskStatus::InProgress => '-',
            TaskStatus::Completed => 'x',
        }
    }
}

/// Checkbox counts for one task document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
}

impl TaskStats {
    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.completed
    }

    /// All tasks completed (vacuously true for an empty document).
    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} completed ({} in progress, {} pending)",
            self.completed,
            self.total(),
            self.in_progress,
            self.pending
        )
    }
}

/// Lifecycle status of a supervised session subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Starting,
    Running,
    Completed,
    Stopped,
    Crashed,
}

impl RunnerStatus {
    /// Terminal statuses never transition again without an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunnerStatus::Completed | RunnerStatus::Stopped | RunnerStatus::Crashed
        )
    }
}

/// Identifies one spec within one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecId {
    pub project_path: PathBuf,
    pub spec_name: String,
}

impl SpecId {
    pub fn new(project_path: impl Into<PathBuf>, spec_name: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            spec_name: spec_name.into(),
        }
    }
}

impl std::fmt::Display for SpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.project_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(""),
            self.spec_name
        )
    }
}

/// Update published by the state poller onto the bounded channel.
///
/// `TaskCountsChanged` and `LogAppended` are coalescable: a consumer must
/// treat each as the latest state, not a delta. `CommitObserved` and
/// `RunnerStatusChanged` are never dropped by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    TaskCountsChanged {
        spec: SpecId,
        stats: TaskStats,
    },
    LogAppended {
        spec: SpecId,
        tail: String,
    },
    CommitObserved {
        spec: SpecId,
        hash: String,
        subject: String,
    },
    RunnerStatusChanged {
        runner_id: Uuid,
        status: RunnerStatus,
        exit_code: Option<i32>,
    },
    ProjectSetChanged {
        projects: Vec<PathBuf>,
    },
}

/// Status code of a smart completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    CommitsCreated,
    Rescued,
    RescuedFinal,
    NothingToDo,
    Timeout,
    ProbeError,
    LlmStopped,
}

/// Result of a smart completion check for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub complete: bool,
    pub new_commits: u32,
    pub probes_used: u32,
    pub rescued: bool,
    pub status: CompletionStatus,
}
