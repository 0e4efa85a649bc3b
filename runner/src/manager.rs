//! Runner manager: session subprocess lifecycle.
//!
//! Owns the set of active runner records, spawns provider subprocesses
//! detached under per-runner log files, monitors liveness, schedules
//! restarts through the retry policy, and persists records so a host
//! restart can re-adopt still-running children.
//!
//! The in-memory map is guarded by a single lock; no lock is ever held
//! across a wait. Retry backoff is realized as a due instant checked by
//! `health_scan`, so scheduling never sleeps inside the manager.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::core::retry::RetryPolicy;
use crate::core::types::{RunnerStatus, StateUpdate};
use crate::error::RunnerError;
use crate::io::config::RunnerConfig;
use crate::io::fs_probe::pid_alive;
use crate::io::git::Git;
use crate::io::persist::{RunnerRecord, RunnerStateFile, load_runner_state, save_runner_state};
use crate::io::process::spawn_logged;
use crate::io::provider::{ProviderKind, cmd_fingerprint};

/// Everything needed to (re)spawn one session subprocess.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub provider: String,
    pub model: String,
    pub argv: Vec<String>,
}

impl LaunchSpec {
    pub fn fingerprint(&self) -> String {
        cmd_fingerprint(&self.argv)
    }
}

/// Terminal outcome of one supervised session, as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerExit {
    pub status: RunnerStatus,
    pub exit_code: Option<i32>,
    pub retry_count: u32,
}

struct Inner {
    records: HashMap<Uuid, RunnerRecord>,
    children: HashMap<Uuid, Child>,
    launches: HashMap<Uuid, LaunchSpec>,
    retry_due: HashMap<Uuid, Instant>,
    /// Terminal records kept for the driver to read after removal from the
    /// active set; never persisted.
    finished: HashMap<Uuid, RunnerRecord>,
    events: Vec<StateUpdate>,
}

pub struct RunnerManager {
    config: RunnerConfig,
    policy: RetryPolicy,
    state_path: PathBuf,
    config_hash: String,
    inner: Mutex<Inner>,
}

impl RunnerManager {
    pub fn new(config: RunnerConfig) -> Self {
        let policy = config.retry_policy();
        let state_path = config.runner_state_path();
        let config_hash = config.config_hash();
        Self {
            config,
            policy,
            state_path,
            config_hash,
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                children: HashMap::new(),
                launches: HashMap::new(),
                retry_due: HashMap::new(),
                finished: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start a supervised session for `(project, spec)`.
    ///
    /// Preconditions are checked first and fail without spawning anything:
    /// no runner may already be active for the spec, the working tree must
    /// be clean, the provider health check must pass, and the task document
    /// must contain open work. The record is persisted before the child is
    /// spawned; a start-time persistence failure fails closed.
    #[instrument(skip_all, fields(spec_name, provider = %launch.provider))]
    pub fn start(
        &self,
        project: &Path,
        spec_name: &str,
        launch: LaunchSpec,
    ) -> Result<RunnerRecord> {
        self.check_preconditions(project, spec_name, &launch)?;

        let git = Git::new(project);
        let baseline_commit = git.head().ok();

        let id = Uuid::new_v4();
        let log_path = self.log_path_for(project, spec_name, 1);
        let now = Utc::now();
        let record = RunnerRecord {
            id,
            project_path: project.to_path_buf(),
            spec_name: spec_name.to_string(),
            provider: launch.provider.clone(),
            model: launch.model.clone(),
            pid: 0,
            cmd_fingerprint: launch.fingerprint(),
            status: RunnerStatus::Starting,
            start_time: now,
            last_activity_time: now,
            last_retry_time: None,
            retry_count: 0,
            max_retries: if self.policy.enabled {
                self.policy.max_retries
            } else {
                0
            },
            config_hash: self.config_hash.clone(),
            log_path: log_path.clone(),
            baseline_commit,
            exit_code: None,
        };

        {
            let mut inner = self.lock();
            inner.records.insert(id, record.clone());
            inner.launches.insert(id, launch.clone());
            // Fail closed: the child must never outlive our knowledge of it.
            if let Err(err) = self.persist_locked(&inner) {
                inner.records.remove(&id);
                inner.launches.remove(&id);
                return Err(RunnerError::Persistence(format!("{err:#}")).into());
            }
        }

        match self.spawn_child(id, &launch, project, &log_path) {
            Ok(()) => {
                let inner = self.lock();
                let record = inner
                    .records
                    .get(&id)
                    .cloned()
                    .context("record missing after spawn")?;
                info!(runner_id = %id, pid = record.pid, "session subprocess started");
                Ok(record)
            }
            Err(err) => {
                warn!(runner_id = %id, error = %err, "spawn failed");
                let retried = {
                    let mut inner = self.lock();
                    self.mark_crashed_locked(&mut inner, id, None);
                    self.maybe_retry_locked(&mut inner, id)
                };
                if retried {
                    let inner = self.lock();
                    inner
                        .records
                        .get(&id)
                        .cloned()
                        .context("record missing after retry schedule")
                } else {
                    self.remove_record(id);
                    Err(RunnerError::SpawnFailed(format!("{err:#}")).into())
                }
            }
        }
    }

    /// Signal graceful termination, escalate to SIGKILL after `grace`, and
    /// always remove the record once the exit is observed.
    #[instrument(skip_all, fields(runner_id = %runner_id))]
    pub fn stop(&self, runner_id: Uuid, grace: Duration) -> Result<()> {
        let (child, record) = {
            let mut inner = self.lock();
            let record = inner
                .records
                .get(&runner_id)
                .cloned()
                .with_context(|| format!("runner {runner_id} not found"))?;
            inner.retry_due.remove(&runner_id);
            (inner.children.remove(&runner_id), record)
        };

        let exit_code = match child {
            Some(child) => stop_child(child, record.pid, grace)?,
            None => {
                if record.pid > 0 && pid_alive(record.pid, &record.cmd_fingerprint) {
                    stop_pid(record.pid, &record.cmd_fingerprint, grace);
                }
                None
            }
        };

        info!(pid = record.pid, ?exit_code, "runner stopped");
        self.finish(runner_id, RunnerStatus::Stopped, exit_code);
        Ok(())
    }

    pub fn status(&self, runner_id: Uuid) -> Option<RunnerStatus> {
        let inner = self.lock();
        inner
            .records
            .get(&runner_id)
            .or_else(|| inner.finished.get(&runner_id))
            .map(|record| record.status)
    }

    pub fn list_active(&self) -> Vec<RunnerRecord> {
        let inner = self.lock();
        let mut records: Vec<RunnerRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|record| record.start_time);
        records
    }

    /// True while the runner still has a live or pending-restart record.
    pub fn is_active(&self, runner_id: Uuid) -> bool {
        self.lock().records.contains_key(&runner_id)
    }

    /// One supervision pass: detect exits, classify them, execute due
    /// retries. Called by the poller each cycle.
    pub fn health_scan(&self) {
        let ids: Vec<Uuid> = {
            let inner = self.lock();
            inner.records.keys().copied().collect()
        };
        for id in ids {
            self.scan_one(id);
        }
        self.run_due_retries();
    }

    /// Schedule a restart for a crashed runner when the policy allows.
    ///
    /// Returns whether a retry was scheduled. Never spawns directly; the
    /// respawn happens on the next `health_scan` once the backoff elapses.
    pub fn maybe_retry(&self, runner_id: Uuid) -> bool {
        let mut inner = self.lock();
        self.maybe_retry_locked(&mut inner, runner_id)
    }

    /// Re-adopt persisted records at process start.
    ///
    /// Records whose PID is alive with a matching command fingerprint and
    /// whose config hash matches stay `running` (without a child handle);
    /// everything else is marked stopped and dropped from the active set.
    pub fn restore(&self) {
        let persisted = load_runner_state(&self.state_path);
        let mut inner = self.lock();
        for mut record in persisted.runners {
            let adoptable = record.status == RunnerStatus::Running
                && record.config_hash == self.config_hash
                && record.pid > 0
                && pid_alive(record.pid, &record.cmd_fingerprint);
            if adoptable {
                info!(runner_id = %record.id, pid = record.pid, "re-adopted running session");
                inner.records.insert(record.id, record);
            } else {
                debug!(runner_id = %record.id, status = ?record.status, "dropping stale record");
                record.status = RunnerStatus::Stopped;
                inner.finished.insert(record.id, record);
            }
        }
        if let Err(err) = self.persist_locked(&inner) {
            warn!(error = %err, "failed to persist restored state");
        }
    }

    /// Block until the runner reaches a terminal state (retries included),
    /// driving `health_scan` while waiting. Cancellation stops the runner.
    pub fn wait_for_exit(&self, runner_id: Uuid, cancel: &CancelToken) -> Result<RunnerExit> {
        loop {
            if cancel.is_cancelled() {
                self.stop(runner_id, Duration::from_secs(5)).ok();
            }
            self.health_scan();
            {
                let inner = self.lock();
                if let Some(record) = inner.finished.get(&runner_id) {
                    return Ok(RunnerExit {
                        status: record.status,
                        exit_code: record.exit_code,
                        retry_count: record.retry_count,
                    });
                }
                if !inner.records.contains_key(&runner_id) {
                    anyhow::bail!("runner {runner_id} unknown");
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// Drain queued status-change updates; the poller is the only caller and
    /// forwards them onto its channel.
    pub fn take_events(&self) -> Vec<StateUpdate> {
        let mut inner = self.lock();
        std::mem::take(&mut inner.events)
    }

    /// Forget a terminal record previously surfaced by `wait_for_exit`.
    pub fn clear_finished(&self, runner_id: Uuid) {
        self.lock().finished.remove(&runner_id);
    }

    fn check_preconditions(
        &self,
        project: &Path,
        spec_name: &str,
        launch: &LaunchSpec,
    ) -> Result<()> {
        {
            let inner = self.lock();
            let duplicate = inner.records.values().any(|record| {
                record.project_path == project
                    && record.spec_name == spec_name
                    && !record.status.is_terminal()
            });
            if duplicate {
                return Err(RunnerError::PreconditionFailed(format!(
                    "a runner is already active for spec '{spec_name}'"
                ))
                .into());
            }
        }

        let tasks_path = self.config.tasks_path(project, spec_name);
        let text = std::fs::read_to_string(&tasks_path).map_err(|err| {
            RunnerError::PreconditionFailed(format!(
                "cannot read {}: {err}",
                tasks_path.display()
            ))
        })?;
        let stats = crate::core::tasks::parse(&text).stats();
        if stats.pending == 0 && stats.in_progress == 0 {
            return Err(RunnerError::PreconditionFailed(format!(
                "spec '{spec_name}' has no open tasks"
            ))
            .into());
        }

        // Orchestrator-owned files (task docs, logs) live under the workflow
        // dir and are exempt from the clean-tree requirement.
        let git = Git::new(project);
        let workflow_prefix = format!("{}/", self.config.workflow_dir_name);
        if let Err(err) = git.ensure_clean_except_prefixes(&[&workflow_prefix]) {
            return Err(RunnerError::PreconditionFailed(format!("{err:#}")).into());
        }

        if let Ok(kind) = ProviderKind::parse(&launch.provider) {
            if let Err(err) = kind.health_check(project) {
                return Err(RunnerError::PreconditionFailed(format!(
                    "provider health check failed: {err:#}"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn spawn_child(
        &self,
        id: Uuid,
        launch: &LaunchSpec,
        project: &Path,
        log_path: &Path,
    ) -> Result<()> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("open log {}", log_path.display()))?;
        let child = spawn_logged(&launch.argv, project, log_file)?;
        let pid = child.id() as i32;

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.children.insert(id, child);
        if let Some(record) = inner.records.get_mut(&id) {
            record.pid = pid;
            record.status = RunnerStatus::Running;
            record.last_activity_time = Utc::now();
            record.log_path = log_path.to_path_buf();
        }
        inner.events.push(StateUpdate::RunnerStatusChanged {
            runner_id: id,
            status: RunnerStatus::Running,
            exit_code: None,
        });
        debug!(runner_id = %id, pid, "child spawned");
        if let Err(err) = self.persist_locked(inner) {
            warn!(error = %err, "failed to persist after spawn");
        }
        Ok(())
    }

    fn scan_one(&self, id: Uuid) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get(&id).cloned() else {
            return;
        };
        if record.status != RunnerStatus::Running {
            return;
        }

        let exit_code = if let Some(child) = inner.children.get_mut(&id) {
            match child.try_wait() {
                Ok(Some(status)) => Some(status.code()),
                Ok(None) => None,
                Err(err) => {
                    warn!(runner_id = %id, error = %err, "try_wait failed");
                    Some(None)
                }
            }
        } else if record.pid > 0 && pid_alive(record.pid, &record.cmd_fingerprint) {
            None
        } else {
            // Adopted record whose process died: exit code unobservable.
            Some(None)
        };

        let Some(exit_code) = exit_code else {
            return;
        };
        inner.children.remove(&id);

        match exit_code {
            Some(0) => {
                drop(inner);
                info!(runner_id = %id, "session completed");
                self.finish(id, RunnerStatus::Completed, Some(0));
            }
            code => {
                warn!(runner_id = %id, exit_code = ?code, "session crashed");
                self.mark_crashed_locked(&mut inner, id, code);
                let retried = self.maybe_retry_locked(&mut inner, id);
                if !retried {
                    drop(inner);
                    self.finish(id, RunnerStatus::Crashed, code);
                }
            }
        }
    }

    fn run_due_retries(&self) {
        let due: Vec<(Uuid, LaunchSpec, PathBuf, PathBuf)> = {
            let mut inner = self.lock();
            let now = Instant::now();
            let ready: Vec<Uuid> = inner
                .retry_due
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(id, _)| *id)
                .collect();
            ready
                .into_iter()
                .filter_map(|id| {
                    inner.retry_due.remove(&id);
                    let record = inner.records.get(&id)?;
                    let launch = inner.launches.get(&id)?.clone();
                    Some((
                        id,
                        launch,
                        record.project_path.clone(),
                        record.log_path.clone(),
                    ))
                })
                .collect()
        };

        for (id, launch, project, log_path) in due {
            info!(runner_id = %id, "restarting crashed session");
            if let Err(err) = self.spawn_child(id, &launch, &project, &log_path) {
                warn!(runner_id = %id, error = %err, "retry spawn failed");
                let retried = {
                    let mut inner = self.lock();
                    self.mark_crashed_locked(&mut inner, id, None);
                    self.maybe_retry_locked(&mut inner, id)
                };
                if !retried {
                    self.finish(id, RunnerStatus::Crashed, None);
                }
            }
        }
    }

    fn maybe_retry_locked(&self, inner: &mut Inner, id: Uuid) -> bool {
        // Adopted records carry no launch spec and cannot be respawned.
        if !inner.launches.contains_key(&id) {
            return false;
        }
        let Some(record) = inner.records.get_mut(&id) else {
            return false;
        };
        if record.status != RunnerStatus::Crashed {
            return false;
        }
        if !self.policy.should_retry(record.retry_count, record.exit_code) {
            return false;
        }
        let delay = self.policy.backoff(record.retry_count);
        record.retry_count += 1;
        record.last_retry_time = Some(Utc::now());
        record.status = RunnerStatus::Starting;
        record.exit_code = None;
        // Sequential log file per attempt, so no attempt clobbers another.
        record.log_path = self.log_path_for(
            &record.project_path,
            &record.spec_name,
            record.retry_count + 1,
        );
        let (retry_count, max_retries) = (record.retry_count, record.max_retries);
        inner.retry_due.insert(id, Instant::now() + delay);
        inner.events.push(StateUpdate::RunnerStatusChanged {
            runner_id: id,
            status: RunnerStatus::Starting,
            exit_code: None,
        });
        info!(
            runner_id = %id,
            retry = format!("{retry_count}/{max_retries}"),
            delay_ms = delay.as_millis() as u64,
            "scheduled restart"
        );
        if let Err(err) = self.persist_locked(inner) {
            warn!(error = %err, "failed to persist retry schedule");
        }
        true
    }

    fn mark_crashed_locked(&self, inner: &mut Inner, id: Uuid, exit_code: Option<i32>) {
        if let Some(record) = inner.records.get_mut(&id) {
            record.status = RunnerStatus::Crashed;
            record.exit_code = exit_code;
            record.last_activity_time = Utc::now();
        }
        inner.events.push(StateUpdate::RunnerStatusChanged {
            runner_id: id,
            status: RunnerStatus::Crashed,
            exit_code,
        });
        if let Err(err) = self.persist_locked(inner) {
            warn!(error = %err, "failed to persist crash");
        }
    }

    /// Move a record out of the active set into the finished graveyard.
    fn finish(&self, id: Uuid, status: RunnerStatus, exit_code: Option<i32>) {
        let mut inner = self.lock();
        inner.children.remove(&id);
        inner.launches.remove(&id);
        inner.retry_due.remove(&id);
        if let Some(mut record) = inner.records.remove(&id) {
            record.status = status;
            record.exit_code = exit_code;
            record.last_activity_time = Utc::now();
            inner.finished.insert(id, record);
        }
        inner.events.push(StateUpdate::RunnerStatusChanged {
            runner_id: id,
            status,
            exit_code,
        });
        if let Err(err) = self.persist_locked(&inner) {
            warn!(error = %err, "failed to persist terminal state");
        }
    }

    fn remove_record(&self, id: Uuid) {
        let mut inner = self.lock();
        inner.records.remove(&id);
        inner.launches.remove(&id);
        inner.retry_due.remove(&id);
        if let Err(err) = self.persist_locked(&inner) {
            warn!(error = %err, "failed to persist removal");
        }
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        let mut runners: Vec<RunnerRecord> = inner.records.values().cloned().collect();
        runners.sort_by_key(|record| record.start_time);
        let state = RunnerStateFile {
            config_hash: self.config_hash.clone(),
            runners,
        };
        save_runner_state(&self.state_path, &state)
    }

    fn log_path_for(&self, project: &Path, spec_name: &str, attempt: u32) -> PathBuf {
        self.config
            .spec_log_dir(project, spec_name)
            .join(format!("{spec_name}_{attempt}.log"))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn stop_child(mut child: Child, pid: i32, grace: Duration) -> Result<Option<i32>> {
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait().context("try_wait during stop")? {
            Some(status) => return Ok(status.code()),
            None if Instant::now() >= deadline => break,
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    warn!(pid, "graceful stop timed out, killing");
    child.kill().context("kill child")?;
    let status = child.wait().context("wait after kill")?;
    Ok(status.code())
}

fn stop_pid(pid: i32, fingerprint: &str, grace: Duration) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(pid, fingerprint) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!(pid, "graceful stop timed out, killing adopted process");
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}
