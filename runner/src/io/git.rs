//! Git probes for the supervision core.
//!
//! The core never mutates repository state; it only observes it through a
//! small, explicit wrapper around `git` subprocess calls. Every call carries
//! a timeout so no probe can block a polling cycle indefinitely.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for observing a git repository.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Current HEAD commit hash.
    pub fn head(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Number of commits reachable from HEAD but not from `baseline`.
    #[instrument(skip_all, fields(baseline))]
    pub fn new_commit_count(&self, baseline: &str) -> Result<u32> {
        let range = format!("{baseline}..HEAD");
        let out = self.run_capture(&["rev-list", &range, "--count"])?;
        let count = out
            .trim()
            .parse::<u32>()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))?;
        debug!(count, "new commits since baseline");
        Ok(count)
    }

    /// Total number of commits reachable from HEAD.
    pub fn commit_count(&self) -> Result<u32> {
        let out = self.run_capture(&["rev-list", "HEAD", "--count"])?;
        out.trim()
            .parse::<u32>()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// Hash and subject of the latest commit.
    pub fn last_commit(&self) -> Result<(String, String)> {
        let out = self.run_capture(&["log", "-1", "--format=%H %s"])?;
        let line = out.trim();
        match line.split_once(' ') {
            Some((hash, subject)) => Ok((hash.to_string(), subject.to_string())),
            None => Ok((line.to_string(), String::new())),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths with uncommitted changes (staged, unstaged, or untracked).
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    pub fn working_tree_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is clean, allowing entries with any of the given
    /// prefixes (orchestrator-owned paths).
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean:\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Ensure the worktree is fully clean (including untracked files).
    pub fn ensure_clean(&self) -> Result<()> {
        self.ensure_clean_except_prefixes(&[])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
