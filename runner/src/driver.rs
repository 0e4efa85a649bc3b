//! Three-phase iteration driver.
//!
//! One iteration is: pre-session validation (deterministic, no subprocess),
//! implementation under the commit gate, then post-session verification
//! with the smart completion check. The driver loops until the spec is done
//! or the no-commit streak trips the circuit breaker.
//!
//! The session backend is a trait so tests drive iterations with scripted
//! sessions instead of real provider subprocesses.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::completion::CompletionChecker;
use crate::core::tasks::{self, Issue, MockPatterns};
use crate::core::types::{CompletionOutcome, RunnerStatus, TaskStats};
use crate::error::RunnerError;
use crate::io::config::RunnerConfig;
use crate::io::event_log::EventLogger;
use crate::io::fs_probe::WorkspaceProbe;
use crate::io::git::Git;
use crate::io::hooks;
use crate::io::probe::SessionProbe;
use crate::io::provider::ProviderKind;
use crate::io::rescue::RescueRunner;
use crate::manager::{LaunchSpec, RunnerManager};

/// What the driver asks a session backend to do.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub project: PathBuf,
    pub spec_name: String,
    pub prompt: String,
}

/// Terminal result of one implementation session, retries included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub status: RunnerStatus,
    pub exit_code: Option<i32>,
    pub retry_count: u32,
}

impl SessionOutcome {
    pub fn success() -> Self {
        Self {
            status: RunnerStatus::Completed,
            exit_code: Some(0),
            retry_count: 0,
        }
    }
}

/// Session backend seam; production runs a supervised provider subprocess.
pub trait SessionRunner {
    fn run_session(&self, request: &SessionRequest) -> Result<SessionOutcome>;
}

/// Production session backend: a supervised subprocess via the manager.
pub struct ManagerSessionRunner {
    manager: Arc<RunnerManager>,
    provider: ProviderKind,
    model: String,
    cancel: CancelToken,
}

impl ManagerSessionRunner {
    pub fn new(
        manager: Arc<RunnerManager>,
        provider: ProviderKind,
        model: impl Into<String>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            manager,
            provider,
            model: model.into(),
            cancel,
        }
    }
}

impl SessionRunner for ManagerSessionRunner {
    fn run_session(&self, request: &SessionRequest) -> Result<SessionOutcome> {
        let overrides = &self.manager.config().provider_config_overrides;
        let argv = self
            .provider
            .build_argv(&request.prompt, &self.model, overrides);
        let launch = LaunchSpec {
            provider: self.provider.name().to_string(),
            model: self.model.clone(),
            argv,
        };
        let record = self
            .manager
            .start(&request.project, &request.spec_name, launch)?;
        let exit = self.manager.wait_for_exit(record.id, &self.cancel)?;
        self.manager.clear_finished(record.id);
        Ok(SessionOutcome {
            status: exit.status,
            exit_code: exit.exit_code,
            retry_count: exit.retry_count,
        })
    }
}

/// Per-iteration verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStep {
    /// Every task is completed; nothing left to run.
    Done,
    /// The iteration ran; `progress` feeds the no-commit streak.
    Continue {
        progress: bool,
        outcome: CompletionOutcome,
    },
}

pub struct Driver<'a> {
    config: &'a RunnerConfig,
    session: &'a dyn SessionRunner,
    probe: &'a dyn SessionProbe,
    rescue: &'a dyn RescueRunner,
    events: &'a EventLogger,
    cancel: CancelToken,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: &'a RunnerConfig,
        session: &'a dyn SessionRunner,
        probe: &'a dyn SessionProbe,
        rescue: &'a dyn RescueRunner,
        events: &'a EventLogger,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            session,
            probe,
            rescue,
            events,
            cancel,
        }
    }

    /// Drive iterations until the spec completes, the circuit breaker
    /// trips, or an unrecoverable error surfaces. Returns the number of
    /// iterations executed.
    #[instrument(skip_all, fields(spec_name))]
    pub fn run_to_completion(&self, project: &Path, spec_name: &str) -> Result<u32> {
        if hooks::recover_stale(project)? {
            self.events.info(
                "commit_gate_recovered",
                serde_json::json!({"project": project.display().to_string()}),
            );
        }

        let mut no_commit_streak = 0u32;
        let mut iteration = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                info!(iteration, "driver cancelled");
                return Ok(iteration);
            }
            iteration += 1;
            match self.run_iteration(project, spec_name, iteration)? {
                IterationStep::Done => {
                    info!(iteration, "spec complete");
                    self.events.info(
                        "iteration_done",
                        serde_json::json!({"spec": spec_name, "iteration": iteration}),
                    );
                    return Ok(iteration);
                }
                IterationStep::Continue { progress: true, .. } => {
                    no_commit_streak = 0;
                }
                IterationStep::Continue {
                    progress: false,
                    outcome,
                } => {
                    no_commit_streak += 1;
                    warn!(
                        streak = no_commit_streak,
                        limit = self.config.no_commit_limit,
                        status = ?outcome.status,
                        "no verified progress this iteration"
                    );
                    if no_commit_streak >= self.config.no_commit_limit {
                        self.events.error(
                            "driver_stalled",
                            serde_json::json!({"spec": spec_name, "streak": no_commit_streak}),
                        );
                        return Err(RunnerError::Stalled {
                            streak: no_commit_streak,
                        }
                        .into());
                    }
                }
            }
        }
    }

    /// One pass through the three phases.
    pub fn run_iteration(
        &self,
        project: &Path,
        spec_name: &str,
        iteration: u32,
    ) -> Result<IterationStep> {
        let tasks_path = self.config.tasks_path(project, spec_name);
        let mock = self.config.mock_patterns();
        let fs_probe = WorkspaceProbe::new(project);

        // Phase 1: pre-session validation.
        let (text, stats_before) =
            self.pre_session_validation(project, spec_name, iteration, &tasks_path, &mock, &fs_probe)?;
        if stats_before.is_done() {
            return Ok(IterationStep::Done);
        }

        // Phase 2: implementation under the commit gate.
        let git = Git::new(project);
        let baseline = git.head().ok();
        self.implementation_session(project, spec_name, &stats_before)?;

        // Phase 3: post-session verification.
        let step = self.post_session_verification(
            project,
            spec_name,
            iteration,
            &tasks_path,
            &mock,
            &fs_probe,
            &text,
            stats_before,
            baseline.as_deref(),
        )?;
        Ok(step)
    }

    fn pre_session_validation(
        &self,
        project: &Path,
        spec_name: &str,
        iteration: u32,
        tasks_path: &Path,
        mock: &MockPatterns,
        fs_probe: &WorkspaceProbe,
    ) -> Result<(String, TaskStats)> {
        let text = fs::read_to_string(tasks_path).map_err(|err| {
            RunnerError::PreconditionFailed(format!(
                "cannot read {}: {err}",
                tasks_path.display()
            ))
        })?;

        if !self.config.three_phase_enabled {
            return Ok((text.clone(), tasks::parse(&text).stats()));
        }

        let doc = tasks::parse(&text);
        let issues = tasks::validate(&text, mock);
        self.write_phase_log(
            project,
            spec_name,
            &format!("validation_{iteration}.log"),
            &render_issue_log(spec_name, iteration, &issues),
        );
        if doc.has_errors() {
            let detail = doc
                .issues()
                .iter()
                .map(|issue| format!("line {}: {}", issue.line, issue.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RunnerError::TaskFormatInvalid(detail).into());
        }

        let reset = tasks::reset_unimplemented(&text, fs_probe, mock);
        let text = if reset.changed() {
            info!(
                reset = reset.changed_ids.len(),
                "reset completed tasks with missing implementations"
            );
            self.events.warn(
                "tasks_reset",
                serde_json::json!({"spec": spec_name, "task_ids": reset.changed_ids}),
            );
            write_tasks_atomic(tasks_path, &reset.text)?;
            reset.text
        } else {
            text
        };

        let stats = tasks::parse(&text).stats();
        Ok((text, stats))
    }

    fn implementation_session(
        &self,
        project: &Path,
        spec_name: &str,
        stats: &TaskStats,
    ) -> Result<()> {
        let gate = if self.config.commit_gate_enabled {
            Some(hooks::enter(project)?)
        } else {
            None
        };

        let request = SessionRequest {
            project: project.to_path_buf(),
            spec_name: spec_name.to_string(),
            prompt: implementation_prompt(spec_name, stats),
        };
        let session_result = self.session.run_session(&request);

        // The gate comes off on every exit path; the guard's drop is the
        // backstop for panics.
        if let Some(gate) = gate {
            gate.release()?;
        }

        match session_result {
            Ok(outcome) => {
                info!(status = ?outcome.status, exit_code = ?outcome.exit_code, "session finished");
                if outcome.status == RunnerStatus::Crashed {
                    self.events.warn(
                        "session_crashed",
                        serde_json::json!({
                            "spec": spec_name,
                            "exit_code": outcome.exit_code,
                            "retries": outcome.retry_count,
                        }),
                    );
                }
                Ok(())
            }
            Err(err) => {
                if let Some(runner_err) = err.downcast_ref::<RunnerError>() {
                    if matches!(runner_err, RunnerError::PreconditionFailed(_)) {
                        return Err(err);
                    }
                }
                // Spawn failures and the like: verification still runs; the
                // streak machinery bounds repeated failures.
                warn!(error = %format!("{err:#}"), "session failed to run");
                self.events.error(
                    "session_error",
                    serde_json::json!({"spec": spec_name, "error": format!("{err:#}")}),
                );
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn post_session_verification(
        &self,
        project: &Path,
        spec_name: &str,
        iteration: u32,
        tasks_path: &Path,
        mock: &MockPatterns,
        fs_probe: &WorkspaceProbe,
        phase1_text: &str,
        stats_before: TaskStats,
        baseline: Option<&str>,
    ) -> Result<IterationStep> {
        // Re-read: the session owns the document during Phase 2.
        let text = fs::read_to_string(tasks_path).unwrap_or_else(|err| {
            warn!(error = %err, "tasks re-read failed, using pre-session snapshot");
            phase1_text.to_string()
        });

        let text = if self.config.three_phase_enabled {
            let promoted = tasks::promote_verified(&text, fs_probe, mock);
            if promoted.changed() {
                info!(promoted = promoted.changed_ids.len(), "promoted verified tasks");
                self.events.info(
                    "tasks_promoted",
                    serde_json::json!({"spec": spec_name, "task_ids": promoted.changed_ids}),
                );
                write_tasks_atomic(tasks_path, &promoted.text)?;
            }
            promoted.text
        } else {
            text
        };

        let stats_after = tasks::parse(&text).stats();
        let task_change = stats_after != stats_before;

        let checker =
            CompletionChecker::new(self.probe, self.rescue, self.config.completion.clone());
        let outcome = checker.check(project, spec_name, baseline, &self.cancel);

        self.write_phase_log(
            project,
            spec_name,
            &format!("verification_{iteration}.log"),
            &render_verification_log(spec_name, iteration, stats_after, task_change, &outcome),
        );

        let progress = outcome.complete || task_change;
        Ok(IterationStep::Continue { progress, outcome })
    }

    fn write_phase_log(&self, project: &Path, spec_name: &str, name: &str, contents: &str) {
        let dir = self.config.spec_log_dir(project, spec_name);
        let path = dir.join(name);
        let result = fs::create_dir_all(&dir)
            .with_context(|| format!("create log dir {}", dir.display()))
            .and_then(|_| {
                fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
            });
        if let Err(err) = result {
            warn!(error = %format!("{err:#}"), "phase log write failed");
        }
    }
}

fn implementation_prompt(spec_name: &str, stats: &TaskStats) -> String {
    format!(
        "Work on spec '{spec_name}'. Progress: {}.\n\
         Implement the remaining tasks one at a time, updating the task \
         checklist as you go. Implementation only: do not create commits; \
         verified work is committed after the session.",
        stats.summary()
    )
}

/// Atomic task-document rewrite (temp file + rename); write failures are
/// surfaced, never partially applied.
fn write_tasks_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .map_err(|err| RunnerError::FsWrite(format!("{}: {err}", tmp_path.display())))?;
    fs::rename(&tmp_path, path)
        .map_err(|err| RunnerError::FsWrite(format!("{}: {err}", path.display())))?;
    Ok(())
}

fn render_issue_log(spec_name: &str, iteration: u32, issues: &[Issue]) -> String {
    let mut out = format!("spec {spec_name} iteration {iteration} validation\n\n");
    if issues.is_empty() {
        out.push_str("no issues\n");
        return out;
    }
    for issue in issues {
        out.push_str(&format!(
            "line {} [{:?}] {:?}: {}\n",
            issue.line, issue.severity, issue.kind, issue.message
        ));
    }
    out
}

fn render_verification_log(
    spec_name: &str,
    iteration: u32,
    stats: TaskStats,
    task_change: bool,
    outcome: &CompletionOutcome,
) -> String {
    format!(
        "spec {spec_name} iteration {iteration} verification\n\n\
         tasks: {}\ntask_change: {task_change}\n\
         completion: status={:?} complete={} new_commits={} probes={} rescued={}\n",
        stats.summary(),
        outcome.status,
        outcome.complete,
        outcome.new_commits,
        outcome.probes_used,
        outcome.rescued,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CompletionStatus;
    use crate::io::probe::{ProbeReply, ProbeStatus};
    use crate::test_support::{ScriptedProbe, ScriptedRescue, ScriptedSession, TestRepo};

    fn working_reply() -> ProbeReply {
        ProbeReply {
            status: ProbeStatus::Working,
            message: String::new(),
            should_continue: true,
            agents_active: None,
            tasks_completed: Vec::new(),
            tasks_pending: Vec::new(),
        }
    }

    fn event_logger(repo: &TestRepo) -> EventLogger {
        EventLogger::new(repo.cache_dir().join("events.log"), 1_000_000, 2)
    }

    #[test]
    fn empty_task_document_is_done_immediately() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "").expect("tasks");
        let config = repo.config();
        let session = ScriptedSession::noop_forever();
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        let step = driver
            .run_iteration(repo.root(), "demo", 1)
            .expect("iteration");
        assert_eq!(step, IterationStep::Done);
        assert_eq!(session.calls(), 0, "no session may run for a done spec");
    }

    #[test]
    fn missing_tasks_file_is_a_precondition_failure() {
        let repo = TestRepo::new().expect("repo");
        let config = repo.config();
        let session = ScriptedSession::noop_forever();
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        let err = driver
            .run_iteration(repo.root(), "ghost", 1)
            .expect_err("must fail");
        let runner_err = err.downcast_ref::<RunnerError>().expect("typed");
        assert_eq!(runner_err.classifier(), "precondition-failed");
    }

    #[test]
    fn structurally_broken_document_aborts_with_task_format_invalid() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [z] 1. Broken mark\n").expect("tasks");
        let config = repo.config();
        let session = ScriptedSession::noop_forever();
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        let err = driver
            .run_iteration(repo.root(), "demo", 1)
            .expect_err("must fail");
        let runner_err = err.downcast_ref::<RunnerError>().expect("typed");
        assert_eq!(runner_err.classifier(), "task-format-invalid");
        assert_eq!(session.calls(), 0);
    }

    #[test]
    fn phase_one_rewrites_false_completions_before_the_session() {
        let repo = TestRepo::new().expect("repo");
        let tasks_path = repo
            .write_tasks(
                "demo",
                "- [x] 2 Implement repo\n  - **Files**:\n    - src/foo.ts\n",
            )
            .expect("tasks");
        let config = repo.config();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen_clone = seen.clone();
        let tasks_clone = tasks_path.clone();
        let session = ScriptedSession::new(vec![Box::new(move |_req: &SessionRequest| {
            *seen_clone.lock().expect("lock") =
                fs::read_to_string(&tasks_clone).expect("read inside session");
            Ok(SessionOutcome::success())
        })]);
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        driver
            .run_iteration(repo.root(), "demo", 1)
            .expect("iteration");
        assert!(
            seen.lock().expect("lock").contains("- [-] 2 Implement repo"),
            "session must observe the reset document"
        );
    }

    #[test]
    fn phase_one_twice_is_a_no_op_on_disk() {
        let repo = TestRepo::new().expect("repo");
        let tasks_path = repo
            .write_tasks(
                "demo",
                "- [x] 1. Ghost\n  - **Files**:\n    - src/ghost.rs\n- [ ] 2. Real\n",
            )
            .expect("tasks");
        let config = repo.config();
        let mock = config.mock_patterns();
        let fs_probe = WorkspaceProbe::new(repo.root());
        let session = ScriptedSession::noop_forever();
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        driver
            .pre_session_validation(repo.root(), "demo", 1, &tasks_path, &mock, &fs_probe)
            .expect("phase 1");
        let after_first = fs::read_to_string(&tasks_path).expect("read");

        driver
            .pre_session_validation(repo.root(), "demo", 2, &tasks_path, &mock, &fs_probe)
            .expect("phase 1 again");
        let after_second = fs::read_to_string(&tasks_path).expect("read");
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn commit_gate_is_removed_even_when_the_session_errors() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. Todo\n").expect("tasks");
        let config = repo.config();
        let session = ScriptedSession::new(vec![Box::new(|_req: &SessionRequest| {
            anyhow::bail!("session exploded")
        })]);
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        driver
            .run_iteration(repo.root(), "demo", 1)
            .expect("iteration survives a session error");
        assert!(!hooks::is_installed(repo.root()).expect("gate check"));
    }

    #[test]
    fn session_commits_count_as_progress() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks("demo", "- [ ] 1. Add foo\n  - **Files**:\n    - src/foo.rs\n")
            .expect("tasks");
        // Gate off: this exercises the direct-commit path.
        let mut config = repo.config();
        config.commit_gate_enabled = false;

        let root = repo.root().to_path_buf();
        let session = ScriptedSession::new(vec![Box::new(move |_req: &SessionRequest| {
            fs::create_dir_all(root.join("src")).expect("mkdir");
            fs::write(root.join("src/foo.rs"), "pub fn foo() {}\n").expect("write");
            crate::test_support::git_commit_all(&root, "feat: add foo");
            Ok(SessionOutcome::success())
        })]);
        let probe = ScriptedProbe::repeating(working_reply());
        let rescue = ScriptedRescue::failing();
        let events = event_logger(&repo);
        let driver = Driver::new(&config, &session, &probe, &rescue, &events, CancelToken::new());

        let step = driver
            .run_iteration(repo.root(), "demo", 1)
            .expect("iteration");
        match step {
            IterationStep::Continue { progress, outcome } => {
                assert!(progress);
                assert_eq!(outcome.status, CompletionStatus::CommitsCreated);
                assert_eq!(outcome.new_commits, 1);
            }
            IterationStep::Done => panic!("task is still in pending state"),
        }
    }
}
