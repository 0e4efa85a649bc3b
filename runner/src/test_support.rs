//! Test-only helpers: throwaway git repositories and scripted fakes for the
//! executor-style seams (sessions, probes, rescues).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::driver::{SessionOutcome, SessionRequest, SessionRunner};
use crate::io::config::{CompletionConfig, RetryConfig, RunnerConfig};

/// A throwaway project: a git repository with an identity, a seed commit,
/// and a spec-workflow layout, inside a workspace directory the runner
/// configuration points at.
pub struct TestRepo {
    temp: TempDir,
    repo: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).context("create repo dir")?;

        run_git(&repo, &["init", "-q"])?;
        run_git(&repo, &["config", "user.email", "test@example.com"])?;
        run_git(&repo, &["config", "user.name", "test"])?;
        std::fs::write(repo.join("README.md"), "hi\n").context("seed file")?;
        run_git(&repo, &["add", "README.md"])?;
        run_git(&repo, &["commit", "-q", "-m", "chore: init"])?;

        Ok(Self { temp, repo })
    }

    /// The project root (a git repository).
    pub fn root(&self) -> &Path {
        &self.repo
    }

    /// The workspace root containing the project.
    pub fn workspace(&self) -> &Path {
        self.temp.path()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    pub fn head(&self) -> Result<String> {
        capture_git(&self.repo, &["rev-parse", "HEAD"])
    }

    /// Write and commit a file relative to the repo root.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<()> {
        let path = self.repo.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create parent")?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {rel}"))?;
        run_git(&self.repo, &["add", rel])?;
        run_git(&self.repo, &["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Create (and commit) a spec's task document. Returns its path.
    pub fn write_tasks(&self, spec_name: &str, text: &str) -> Result<PathBuf> {
        let config = self.config();
        let path = config.tasks_path(&self.repo, spec_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create spec dir")?;
        }
        std::fs::write(&path, text).context("write tasks")?;
        run_git(&self.repo, &["add", "-A"])?;
        run_git(&self.repo, &["commit", "-q", "-m", "chore: seed tasks"])?;
        Ok(path)
    }

    /// Configuration rooted at this workspace, tuned for sub-second tests.
    pub fn config(&self) -> RunnerConfig {
        RunnerConfig {
            workspace_root: self.temp.path().to_path_buf(),
            cache_dir: self.cache_dir(),
            poll_interval_s: 1,
            retry: RetryConfig {
                max_retries: 2,
                base_backoff_s: 0,
                multiplier: 2.0,
                cap_s: 1,
                on_crash: true,
            },
            completion: CompletionConfig {
                max_probes: 2,
                probe_interval_s: 0,
                probe_timeout_s: 1,
                final_rescue: true,
            },
            ..RunnerConfig::default()
        }
    }
}

/// A runner manager configured against a `TestRepo` workspace.
pub fn manager_for(repo: &TestRepo) -> crate::manager::RunnerManager {
    crate::manager::RunnerManager::new(repo.config())
}

/// Launch spec for a plain command, for supervising non-AI children.
pub fn launch_with(argv: &[&str]) -> crate::manager::LaunchSpec {
    crate::manager::LaunchSpec {
        provider: "test".to_string(),
        model: "none".to_string(),
        argv: argv.iter().map(|part| part.to_string()).collect(),
    }
}

/// Stage everything and commit; panics on failure (test helper).
pub fn git_commit_all(root: &Path, message: &str) {
    run_git(root, &["add", "-A"]).expect("git add");
    run_git(root, &["commit", "-q", "-m", message]).expect("git commit");
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(())
}

fn capture_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Scripted probe: returns queued replies in order, then either a fixed
/// repeating reply or an exhausted-script error.
pub struct ScriptedProbe {
    replies: Mutex<VecDeque<crate::io::probe::ProbeReply>>,
    repeat: Option<crate::io::probe::ProbeReply>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(replies: Vec<crate::io::probe::ProbeReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn repeating(reply: crate::io::probe::ProbeReply) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl crate::io::probe::SessionProbe for ScriptedProbe {
    fn probe(&self, _project: &Path) -> crate::io::probe::ProbeReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match queued {
            Some(reply) => reply,
            None => match &self.repeat {
                Some(reply) => reply.clone(),
                None => crate::io::probe::ProbeReply::error("probe script exhausted"),
            },
        }
    }
}

/// Scripted rescue: fixed success/failure, with an optional side effect
/// (e.g. committing the dirty tree) run before reporting success.
pub struct ScriptedRescue {
    ok: bool,
    effect: Option<Box<dyn Fn(&Path) + Send + Sync>>,
    calls: AtomicU32,
}

impl ScriptedRescue {
    pub fn succeeding(effect: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        Self {
            ok: true,
            effect: Some(Box::new(effect)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            ok: false,
            effect: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl crate::io::rescue::RescueRunner for ScriptedRescue {
    fn rescue(&self, project: &Path, _spec_name: &str) -> crate::io::rescue::RescueOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(effect) = &self.effect {
            effect(project);
        }
        crate::io::rescue::RescueOutcome {
            ok: self.ok,
            detail: if self.ok { "scripted success" } else { "scripted failure" }.to_string(),
        }
    }
}

/// One scripted session invocation.
pub type SessionScript = Box<dyn FnOnce(&SessionRequest) -> Result<SessionOutcome> + Send>;

/// Scripted session backend: runs queued closures in order; once exhausted,
/// either succeeds as a no-op or fails, depending on the constructor.
pub struct ScriptedSession {
    scripts: Mutex<VecDeque<SessionScript>>,
    noop_when_exhausted: bool,
    calls: AtomicU32,
}

impl ScriptedSession {
    pub fn new(scripts: Vec<SessionScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            noop_when_exhausted: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Every session succeeds without touching anything.
    pub fn noop_forever() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            noop_when_exhausted: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SessionRunner for ScriptedSession {
    fn run_session(&self, request: &SessionRequest) -> Result<SessionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match script {
            Some(script) => script(request),
            None if self.noop_when_exhausted => Ok(SessionOutcome::success()),
            None => Err(anyhow!("session script exhausted")),
        }
    }
}
