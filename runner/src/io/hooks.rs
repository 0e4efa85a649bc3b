//! Commit gate: a scoped, repository-local block on human commits.
//!
//! During an implementation session the gate replaces the repository's
//! `pre-commit` hook with one that rejects every commit. Any pre-existing
//! hook is backed up under a nonce name and restored bit-for-bit on exit.
//! The installed hook carries a stable sentinel line so a recovery sweep can
//! identify and clean up gates left behind by a crashed run.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, warn};

/// Stable marker token; the recovery sweep keys on exactly this line.
pub const GATE_SENTINEL: &str = "# spec-runner commit gate";

const HOOK_BODY: &str = "#!/bin/sh\n\
# spec-runner commit gate\n\
# Installed for the duration of an implementation session.\n\
echo \"commits are blocked while an implementation session is running\" >&2\n\
echo \"verified work is committed during post-session verification\" >&2\n\
exit 1\n";

const BACKUP_PREFIX: &str = "pre-commit.bak-";

fn hooks_dir(repo: &Path) -> PathBuf {
    repo.join(".git").join("hooks")
}

fn hook_path(repo: &Path) -> PathBuf {
    hooks_dir(repo).join("pre-commit")
}

/// Install the commit gate, backing up any existing `pre-commit` hook.
///
/// Returns a guard that removes the gate (and restores the backup) when
/// dropped, so cleanup runs on every exit path including panics.
pub fn enter(repo: &Path) -> Result<GateGuard> {
    let dir = hooks_dir(repo);
    fs::create_dir_all(&dir).with_context(|| format!("create hooks dir {}", dir.display()))?;
    let hook = hook_path(repo);

    if hook.exists() {
        if is_gate(&hook)? {
            // Leftover gate from a crashed run; replace it, keep its backup.
            fs::remove_file(&hook).with_context(|| format!("remove stale {}", hook.display()))?;
        } else {
            let backup = dir.join(format!("{BACKUP_PREFIX}{}", nonce()));
            fs::rename(&hook, &backup)
                .with_context(|| format!("back up {} to {}", hook.display(), backup.display()))?;
            debug!(backup = %backup.display(), "backed up existing pre-commit hook");
        }
    }

    fs::write(&hook, HOOK_BODY).with_context(|| format!("write {}", hook.display()))?;
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", hook.display()))?;
    debug!(repo = %repo.display(), "commit gate installed");

    Ok(GateGuard {
        repo: repo.to_path_buf(),
        armed: true,
    })
}

/// Remove the gate hook and restore the most recent backup if present.
///
/// Idempotent; safe to call when `enter` was never called or the gate was
/// already removed. A `pre-commit` hook that is not ours is left untouched.
pub fn exit(repo: &Path) -> Result<()> {
    let hook = hook_path(repo);
    if hook.exists() && is_gate(&hook)? {
        fs::remove_file(&hook).with_context(|| format!("remove {}", hook.display()))?;
        debug!(repo = %repo.display(), "commit gate removed");
    }
    if !hook.exists() {
        if let Some(backup) = newest_backup(repo)? {
            fs::rename(&backup, &hook).with_context(|| {
                format!("restore {} to {}", backup.display(), hook.display())
            })?;
            debug!(repo = %repo.display(), "restored original pre-commit hook");
        }
    }
    Ok(())
}

/// Clean up a gate left behind by a crashed run.
///
/// Returns true when a stale gate was found (and removed / its backup
/// restored); callers log a `commit_gate_recovered` event in that case.
pub fn recover_stale(repo: &Path) -> Result<bool> {
    let hook = hook_path(repo);
    if !hook.exists() || !is_gate(&hook)? {
        return Ok(false);
    }
    warn!(repo = %repo.display(), "found stale commit gate from a previous run");
    exit(repo)?;
    Ok(true)
}

/// True when the gate is currently installed.
pub fn is_installed(repo: &Path) -> Result<bool> {
    let hook = hook_path(repo);
    if !hook.exists() {
        return Ok(false);
    }
    is_gate(&hook)
}

/// RAII guard: removes the gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    repo: PathBuf,
    armed: bool,
}

impl GateGuard {
    /// Remove the gate now, surfacing any error. Disarms the drop cleanup.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        exit(&self.repo)
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = exit(&self.repo) {
            warn!(repo = %self.repo.display(), error = %err, "failed to remove commit gate");
        }
    }
}

fn is_gate(hook: &Path) -> Result<bool> {
    let contents =
        fs::read_to_string(hook).with_context(|| format!("read {}", hook.display()))?;
    Ok(contents.lines().any(|line| line.trim() == GATE_SENTINEL))
}

fn newest_backup(repo: &Path) -> Result<Option<PathBuf>> {
    let dir = hooks_dir(repo);
    if !dir.exists() {
        return Ok(None);
    }
    let mut backups: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(BACKUP_PREFIX))
        })
        .collect();
    backups.sort_by_key(|path| {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });
    Ok(backups.pop())
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn enter_installs_executable_blocking_hook() {
        let repo = TestRepo::new().expect("repo");
        let guard = enter(repo.root()).expect("enter");

        let hook = hook_path(repo.root());
        assert!(hook.exists());
        let contents = fs::read_to_string(&hook).expect("read hook");
        assert!(contents.contains(GATE_SENTINEL));
        let mode = fs::metadata(&hook).expect("meta").permissions().mode();
        assert_ne!(mode & 0o111, 0, "hook must be executable");

        guard.release().expect("release");
        assert!(!hook.exists());
    }

    #[test]
    fn gate_blocks_commits_while_installed() {
        let repo = TestRepo::new().expect("repo");
        let guard = enter(repo.root()).expect("enter");

        fs::write(repo.root().join("blocked.txt"), "x").expect("write");
        let result = repo.commit_file("blocked2.txt", "y", "feat: should be blocked");
        assert!(result.is_err(), "commit must be rejected by the gate");

        guard.release().expect("release");
        repo.commit_file("allowed.txt", "z", "feat: allowed again")
            .expect("commit after release");
    }

    #[test]
    fn enter_exit_restores_original_hook_bit_for_bit() {
        let repo = TestRepo::new().expect("repo");
        let hook = hook_path(repo.root());
        fs::create_dir_all(hook.parent().expect("parent")).expect("mkdir");
        let original = "#!/bin/sh\necho custom hook\nexit 0\n";
        fs::write(&hook, original).expect("write original");
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o700)).expect("chmod");

        let guard = enter(repo.root()).expect("enter");
        assert!(is_installed(repo.root()).expect("installed"));
        guard.release().expect("release");

        assert_eq!(fs::read_to_string(&hook).expect("read"), original);
        let mode = fs::metadata(&hook).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn exit_is_idempotent_and_safe_without_enter() {
        let repo = TestRepo::new().expect("repo");
        exit(repo.root()).expect("exit without enter");
        exit(repo.root()).expect("exit twice");
    }

    #[test]
    fn exit_leaves_foreign_hook_untouched() {
        let repo = TestRepo::new().expect("repo");
        let hook = hook_path(repo.root());
        fs::create_dir_all(hook.parent().expect("parent")).expect("mkdir");
        fs::write(&hook, "#!/bin/sh\nexit 0\n").expect("write");

        exit(repo.root()).expect("exit");
        assert!(hook.exists());
    }

    #[test]
    fn recover_stale_cleans_leftover_gate_and_restores_backup() {
        let repo = TestRepo::new().expect("repo");
        let hook = hook_path(repo.root());
        fs::create_dir_all(hook.parent().expect("parent")).expect("mkdir");
        let original = "#!/bin/sh\necho original\n";
        fs::write(&hook, original).expect("write original");

        // Simulate a crash: enter but leak the guard.
        let guard = enter(repo.root()).expect("enter");
        std::mem::forget(guard);
        assert!(is_installed(repo.root()).expect("installed"));

        assert!(recover_stale(repo.root()).expect("recover"));
        assert_eq!(fs::read_to_string(&hook).expect("read"), original);

        // Nothing left to recover on a second sweep.
        assert!(!recover_stale(repo.root()).expect("recover again"));
    }

    #[test]
    fn guard_drop_removes_gate() {
        let repo = TestRepo::new().expect("repo");
        {
            let _guard = enter(repo.root()).expect("enter");
            assert!(is_installed(repo.root()).expect("installed"));
        }
        assert!(!is_installed(repo.root()).expect("installed"));
    }
}
