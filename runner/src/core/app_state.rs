//! Consumer-side fold of poller updates.
//!
//! All mutation happens on the single thread draining the poller's channel;
//! the poller itself never touches this state.

use std::collections::HashMap;
use std::path::PathBuf;

use uuid::Uuid;

use crate::core::types::{RunnerStatus, SpecId, StateUpdate, TaskStats};

/// Latest observed state, folded from `StateUpdate`s.
#[derive(Debug, Default)]
pub struct AppState {
    /// Bound on the retained log tail per spec, in bytes.
    pub log_tail_limit: usize,
    task_stats: HashMap<SpecId, TaskStats>,
    log_tails: HashMap<SpecId, String>,
    runner_statuses: HashMap<Uuid, (RunnerStatus, Option<i32>)>,
    projects: Vec<PathBuf>,
}

impl AppState {
    pub fn new(log_tail_limit: usize) -> Self {
        Self {
            log_tail_limit,
            ..Self::default()
        }
    }

    /// Fold one update. Coalesced updates replace, appended tails accumulate
    /// up to the configured bound.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::TaskCountsChanged { spec, stats } => {
                self.task_stats.insert(spec, stats);
            }
            StateUpdate::LogAppended { spec, tail } => {
                let buf = self.log_tails.entry(spec).or_default();
                buf.push_str(&tail);
                if self.log_tail_limit > 0 && buf.len() > self.log_tail_limit {
                    let mut cut = buf.len() - self.log_tail_limit;
                    while !buf.is_char_boundary(cut) {
                        cut += 1;
                    }
                    // Keep the suffix; tails are only ever read as context.
                    let trimmed = buf.split_off(cut);
                    *buf = trimmed;
                }
            }
            StateUpdate::CommitObserved { .. } => {}
            StateUpdate::RunnerStatusChanged {
                runner_id,
                status,
                exit_code,
            } => {
                self.runner_statuses.insert(runner_id, (status, exit_code));
            }
            StateUpdate::ProjectSetChanged { projects } => {
                self.projects = projects;
            }
        }
    }

    pub fn stats_for(&self, spec: &SpecId) -> Option<TaskStats> {
        self.task_stats.get(spec).copied()
    }

    pub fn log_tail(&self, spec: &SpecId) -> Option<&str> {
        self.log_tails.get(spec).map(String::as_str)
    }

    pub fn runner_status(&self, runner_id: &Uuid) -> Option<RunnerStatus> {
        self.runner_statuses.get(runner_id).map(|(s, _)| *s)
    }

    pub fn projects(&self) -> &[PathBuf] {
        &self.projects
    }
}
