//! Background state poller.
//!
//! A single thread observes the filesystem (task documents, session logs,
//! git HEAD, project membership) on a fixed interval and publishes
//! `StateUpdate`s onto a bounded channel. All mutation of consumer state
//! happens on the draining side; the poller owns only its mtime bookkeeping.
//!
//! Backpressure: `TaskCountsChanged` and `LogAppended` are coalescable, so
//! on a full channel the newest update per spec is parked and re-sent next
//! cycle (last writer wins). `CommitObserved` and `RunnerStatusChanged` are
//! never dropped and use blocking sends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::JoinHandle;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, sleep_with_cancel};
use crate::core::tasks;
use crate::core::types::{SpecId, StateUpdate};
use crate::io::config::RunnerConfig;
use crate::io::discovery::{discover_specs, scan_projects};
use crate::io::fs_probe::{mtime, tail};
use crate::io::git::Git;
use crate::manager::RunnerManager;

pub const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// The poller's outbound channel with the default capacity.
pub fn update_channel() -> (SyncSender<StateUpdate>, Receiver<StateUpdate>) {
    sync_channel(UPDATE_CHANNEL_CAPACITY)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKind {
    TaskCounts,
    LogTail,
}

pub struct StatePoller {
    config: RunnerConfig,
    manager: Arc<RunnerManager>,
    tx: SyncSender<StateUpdate>,
    last_mtimes: HashMap<PathBuf, SystemTime>,
    log_offsets: HashMap<PathBuf, u64>,
    last_heads: HashMap<PathBuf, String>,
    last_projects: Option<Vec<PathBuf>>,
    pending: HashMap<(SpecId, PendingKind), StateUpdate>,
}

impl StatePoller {
    pub fn new(
        config: RunnerConfig,
        manager: Arc<RunnerManager>,
        tx: SyncSender<StateUpdate>,
    ) -> Self {
        Self {
            config,
            manager,
            tx,
            last_mtimes: HashMap::new(),
            log_offsets: HashMap::new(),
            last_heads: HashMap::new(),
            last_projects: None,
            pending: HashMap::new(),
        }
    }

    /// Run cycles until cancelled. Shutdown finishes the in-flight cycle.
    pub fn spawn(mut self, cancel: CancelToken) -> JoinHandle<()> {
        std::thread::spawn(move || {
            info!(
                interval_s = self.config.poll_interval_s,
                "state poller started"
            );
            while !cancel.is_cancelled() {
                self.run_cycle();
                if !sleep_with_cancel(self.config.poll_interval(), &cancel) {
                    break;
                }
            }
            info!("state poller stopped");
        })
    }

    /// One polling cycle, in the documented emission order.
    pub fn run_cycle(&mut self) {
        self.flush_pending();

        let projects = match scan_projects(&self.config) {
            Ok(projects) => projects,
            Err(err) => {
                warn!(error = %err, "project scan failed");
                self.last_projects.clone().unwrap_or_default()
            }
        };
        if self.last_projects.as_ref() != Some(&projects) {
            self.last_projects = Some(projects.clone());
            self.send_critical(StateUpdate::ProjectSetChanged {
                projects: projects.clone(),
            });
        }

        for project in &projects {
            self.poll_project(project);
        }

        self.manager.health_scan();
        for event in self.manager.take_events() {
            self.send_critical(event);
        }
    }

    fn poll_project(&mut self, project: &Path) {
        let specs = match discover_specs(&self.config, project) {
            Ok(specs) => specs,
            Err(err) => {
                warn!(project = %project.display(), error = %err, "spec scan failed");
                return;
            }
        };

        let head_changed = self.observe_head(project);

        for (spec_name, _) in &specs {
            let spec = SpecId::new(project, spec_name.clone());
            self.poll_tasks(&spec);
            self.poll_log(&spec);
            if let Some((hash, subject)) = &head_changed {
                self.send_critical(StateUpdate::CommitObserved {
                    spec: spec.clone(),
                    hash: hash.clone(),
                    subject: subject.clone(),
                });
            }
        }
    }

    fn poll_tasks(&mut self, spec: &SpecId) {
        let path = self
            .config
            .tasks_path(&spec.project_path, &spec.spec_name);
        if !self.file_changed(&path) {
            return;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                // Degrade to last-known counts on read errors.
                warn!(path = %path.display(), error = %err, "tasks read failed");
                return;
            }
        };
        let stats = tasks::parse(&text).stats();
        debug!(spec = %spec, ?stats, "task counts changed");
        self.send_droppable(
            spec.clone(),
            PendingKind::TaskCounts,
            StateUpdate::TaskCountsChanged {
                spec: spec.clone(),
                stats,
            },
        );
    }

    fn poll_log(&mut self, spec: &SpecId) {
        let Some(log_path) = self.latest_log(spec) else {
            return;
        };
        if !self.file_changed(&log_path) {
            return;
        }
        let size = match std::fs::metadata(&log_path) {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        let offset = self.log_offsets.get(&log_path).copied().unwrap_or(0);
        let offset = if size < offset {
            // Rotated or truncated underneath us; restart from the top.
            debug!(path = %log_path.display(), "log shrank, resetting offset");
            0
        } else {
            offset
        };

        let unread = size - offset;
        let to_read = unread.min(self.config.log_tail_bytes);
        let bytes = match tail(&log_path, to_read) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %log_path.display(), error = %err, "log tail failed");
                return;
            }
        };
        self.log_offsets.insert(log_path, size);
        if bytes.is_empty() {
            return;
        }
        self.send_droppable(
            spec.clone(),
            PendingKind::LogTail,
            StateUpdate::LogAppended {
                spec: spec.clone(),
                tail: String::from_utf8_lossy(&bytes).to_string(),
            },
        );
    }

    /// Most recently modified file in the spec's log directory.
    fn latest_log(&self, spec: &SpecId) -> Option<PathBuf> {
        let dir = self
            .config
            .spec_log_dir(&spec.project_path, &spec.spec_name);
        let entries = std::fs::read_dir(&dir).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .max_by_key(|path| mtime(path).unwrap_or(SystemTime::UNIX_EPOCH))
    }

    fn observe_head(&mut self, project: &Path) -> Option<(String, String)> {
        let git = Git::new(project);
        let head = git.head().ok()?;
        let previous = self.last_heads.insert(project.to_path_buf(), head.clone());
        match previous {
            // First observation establishes the baseline, no event.
            None => None,
            Some(prev) if prev == head => None,
            Some(_) => {
                let (hash, subject) = git.last_commit().ok()?;
                Some((hash, subject))
            }
        }
    }

    fn file_changed(&mut self, path: &Path) -> bool {
        let Some(current) = mtime(path) else {
            return false;
        };
        match self.last_mtimes.insert(path.to_path_buf(), current) {
            None => true,
            Some(previous) => current > previous,
        }
    }

    fn flush_pending(&mut self) {
        let parked = std::mem::take(&mut self.pending);
        for ((spec, kind), update) in parked {
            self.send_droppable(spec, kind, update);
        }
    }

    fn send_droppable(&mut self, spec: SpecId, kind: PendingKind, update: StateUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                // Last writer wins: a newer update for the same spec replaces
                // whatever was parked.
                self.pending.insert((spec, kind), update);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("update channel disconnected");
            }
        }
    }

    fn send_critical(&self, update: StateUpdate) {
        if self.tx.send(update).is_err() {
            debug!("update channel disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStats;
    use crate::test_support::{TestRepo, manager_for};
    use std::sync::mpsc::sync_channel;

    fn poller_with(
        repo: &TestRepo,
        capacity: usize,
    ) -> (StatePoller, Receiver<StateUpdate>) {
        let manager = Arc::new(manager_for(repo));
        let config = manager.config().clone();
        let (tx, rx) = sync_channel(capacity);
        (StatePoller::new(config, manager, tx), rx)
    }

    fn drain(rx: &Receiver<StateUpdate>) -> Vec<StateUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[test]
    fn first_cycle_emits_project_set_and_task_counts() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. One\n- [x] 2. Two\n  - **Files**:\n    - src/a.rs\n")
            .expect("tasks");
        let (mut poller, rx) = poller_with(&repo, 64);

        poller.run_cycle();
        let updates = drain(&rx);

        assert!(matches!(
            updates.first(),
            Some(StateUpdate::ProjectSetChanged { projects }) if projects.len() == 1
        ));
        let stats = updates.iter().find_map(|update| match update {
            StateUpdate::TaskCountsChanged { stats, .. } => Some(*stats),
            _ => None,
        });
        // SP1: emitted counts match a parse of the current document.
        assert_eq!(
            stats,
            Some(TaskStats {
                pending: 1,
                in_progress: 0,
                completed: 1,
            })
        );
    }

    #[test]
    fn unchanged_files_emit_nothing_on_second_cycle() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. One\n").expect("tasks");
        let (mut poller, rx) = poller_with(&repo, 64);

        poller.run_cycle();
        drain(&rx);
        poller.run_cycle();
        let updates = drain(&rx);
        assert!(
            updates.is_empty(),
            "steady state must be quiet, got {updates:?}"
        );
    }

    #[test]
    fn commit_emits_commit_observed_for_each_spec() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. One\n").expect("tasks");
        let (mut poller, rx) = poller_with(&repo, 64);

        poller.run_cycle();
        drain(&rx);

        repo.commit_file("src.rs", "fn main() {}", "feat: add src")
            .expect("commit");
        poller.run_cycle();
        let updates = drain(&rx);

        let commit = updates.iter().find_map(|update| match update {
            StateUpdate::CommitObserved { subject, .. } => Some(subject.clone()),
            _ => None,
        });
        assert_eq!(commit.as_deref(), Some("feat: add src"));
    }

    #[test]
    fn log_appends_emit_only_new_suffix_and_survive_rotation() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. One\n").expect("tasks");
        let (mut poller, rx) = poller_with(&repo, 64);

        let log_dir = poller.config.spec_log_dir(repo.root(), "demo");
        std::fs::create_dir_all(&log_dir).expect("mkdir");
        let log_path = log_dir.join("demo_1.log");
        std::fs::write(&log_path, "first\n").expect("write");

        poller.run_cycle();
        let first_tail = drain(&rx).into_iter().find_map(|update| match update {
            StateUpdate::LogAppended { tail, .. } => Some(tail),
            _ => None,
        });
        assert_eq!(first_tail.as_deref(), Some("first\n"));

        // Append: only the suffix is emitted.
        std::fs::write(&log_path, "first\nsecond\n").expect("append");
        bump_mtime(&log_path);
        poller.run_cycle();
        let second_tail = drain(&rx).into_iter().find_map(|update| match update {
            StateUpdate::LogAppended { tail, .. } => Some(tail),
            _ => None,
        });
        assert_eq!(second_tail.as_deref(), Some("second\n"));

        // Rotation: the file shrinks; the poller resets and resumes.
        std::fs::write(&log_path, "fresh\n").expect("rotate");
        bump_mtime(&log_path);
        poller.run_cycle();
        let rotated_tail = drain(&rx).into_iter().find_map(|update| match update {
            StateUpdate::LogAppended { tail, .. } => Some(tail),
            _ => None,
        });
        assert_eq!(rotated_tail.as_deref(), Some("fresh\n"));
    }

    #[test]
    fn full_channel_parks_droppable_updates_latest_wins() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. One\n").expect("tasks");
        // Capacity 1: the ProjectSetChanged fills the channel.
        let (mut poller, rx) = poller_with(&repo, 1);

        poller.run_cycle();
        assert_eq!(poller.pending.len(), 1, "task counts parked");

        // Consumer drains; next cycle delivers the parked update.
        drain(&rx);
        poller.run_cycle();
        let updates = drain(&rx);
        assert!(updates
            .iter()
            .any(|update| matches!(update, StateUpdate::TaskCountsChanged { .. })));
    }

    // Filesystem mtime granularity can swallow same-instant writes, so tests
    // push the mtime explicitly into the future.
    fn bump_mtime(path: &Path) {
        let base = mtime(path).unwrap_or_else(SystemTime::now);
        let later = base + std::time::Duration::from_secs(2);
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .expect("open for mtime bump");
        file.set_times(std::fs::FileTimes::new().set_modified(later))
            .expect("set times");
    }
}
