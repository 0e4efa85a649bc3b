//! Durable state: the runner state file and the project discovery cache.
//!
//! All writes go through temp-file-plus-rename so a crash mid-write never
//! leaves a torn document. A corrupt state file logs a warning, is removed,
//! and reads as empty; supervision carries on from live observation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::types::RunnerStatus;

/// Durable handle for one supervised session subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerRecord {
    pub id: Uuid,
    pub project_path: PathBuf,
    pub spec_name: String,
    pub provider: String,
    pub model: String,
    pub pid: i32,
    /// Stable substring of the child's argv; together with the PID this
    /// defeats PID reuse.
    pub cmd_fingerprint: String,
    pub status: RunnerStatus,
    pub start_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub config_hash: String,
    pub log_path: PathBuf,
    /// HEAD at subprocess start; None when the project had no commits yet.
    pub baseline_commit: Option<String>,
    pub exit_code: Option<i32>,
}

/// The on-disk runner state document: one per host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerStateFile {
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub runners: Vec<RunnerRecord>,
}

/// Load the runner state file.
///
/// Missing file reads as empty. A corrupt file logs a warning, is deleted,
/// and also reads as empty.
pub fn load_runner_state(path: &Path) -> RunnerStateFile {
    if !path.exists() {
        return RunnerStateFile::default();
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable runner state file");
            return RunnerStateFile::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(state) => {
            debug!(path = %path.display(), "runner state loaded");
            state
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt runner state file, removing");
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove corrupt state file");
            }
            RunnerStateFile::default()
        }
    }
}

/// Atomically write the runner state file (temp file + rename).
pub fn save_runner_state(path: &Path, state: &RunnerStateFile) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize runner state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Cached result of a workspace discovery walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectCache {
    pub root: PathBuf,
    /// Digest of the configured workspace root; a changed root invalidates.
    pub root_digest: String,
    pub scanned_at: DateTime<Utc>,
    pub projects: Vec<PathBuf>,
}

/// Load the project cache. Missing or corrupt reads as `None` (corrupt files
/// are removed).
pub fn load_project_cache(path: &Path) -> Option<ProjectCache> {
    if !path.exists() {
        return None;
    }
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(cache) => Some(cache),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt project cache, removing");
            let _ = fs::remove_file(path);
            None
        }
    }
}

pub fn save_project_cache(path: &Path, cache: &ProjectCache) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(cache).context("serialize project cache")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
