//! Project and spec discovery.
//!
//! A project is any directory under the workspace root that contains the
//! configured workflow directory; a spec is any directory under the
//! project's `specs` subdirectory. Discovery results are cached with a root
//! digest and a max age so repeated CLI invocations skip the walk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::io::config::RunnerConfig;
use crate::io::persist::{ProjectCache, load_project_cache, save_project_cache};

/// Discover projects under the configured workspace root.
///
/// Serves from the cache when it is fresh and matches the configured root;
/// `force_refresh` always rescans. The cache write is best-effort.
pub fn discover_projects(cfg: &RunnerConfig, force_refresh: bool) -> Result<Vec<PathBuf>> {
    let cache_path = cfg.project_cache_path();
    if !force_refresh {
        if let Some(cache) = load_project_cache(&cache_path) {
            if cache_is_valid(cfg, &cache) {
                debug!(count = cache.projects.len(), "serving projects from cache");
                return Ok(cache.projects);
            }
        }
    }

    let projects = scan_projects(cfg)?;
    let cache = ProjectCache {
        root: cfg.workspace_root.clone(),
        root_digest: root_digest(&cfg.workspace_root),
        scanned_at: Utc::now(),
        projects: projects.clone(),
    };
    if let Err(err) = save_project_cache(&cache_path, &cache) {
        warn!(error = %err, "failed to write project cache");
    }
    Ok(projects)
}

/// Walk the workspace root for directories containing the workflow dir.
pub fn scan_projects(cfg: &RunnerConfig) -> Result<Vec<PathBuf>> {
    let root = &cfg.workspace_root;
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut projects = Vec::new();
    for entry in
        fs::read_dir(root).with_context(|| format!("list workspace root {}", root.display()))?
    {
        let entry = entry.with_context(|| format!("read entry under {}", root.display()))?;
        let path = entry.path();
        if path.is_dir() && path.join(&cfg.workflow_dir_name).is_dir() {
            projects.push(path);
        }
    }
    // The root itself may be a project when pointed directly at one.
    if root.join(&cfg.workflow_dir_name).is_dir() {
        projects.push(root.clone());
    }
    projects.sort();
    debug!(count = projects.len(), "scanned projects");
    Ok(projects)
}

/// List spec directories within a project, sorted by name.
pub fn discover_specs(cfg: &RunnerConfig, project: &Path) -> Result<Vec<(String, PathBuf)>> {
    let specs_dir = project
        .join(&cfg.workflow_dir_name)
        .join(&cfg.specs_subdir);
    if !specs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut specs = Vec::new();
    for entry in
        fs::read_dir(&specs_dir).with_context(|| format!("list specs {}", specs_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry under {}", specs_dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        specs.push((name, path));
    }
    specs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(specs)
}

/// Specs of a project that still have pending or in-progress tasks.
pub fn unfinished_specs(
    cfg: &RunnerConfig,
    project: &Path,
) -> Result<Vec<(String, PathBuf)>> {
    let mut unfinished = Vec::new();
    for (name, path) in discover_specs(cfg, project)? {
        let tasks_path = path.join(&cfg.tasks_filename);
        let Ok(text) = fs::read_to_string(&tasks_path) else {
            continue;
        };
        let stats = crate::core::tasks::parse(&text).stats();
        if stats.total() > 0 && !stats.is_done() {
            unfinished.push((name, path));
        }
    }
    Ok(unfinished)
}

fn cache_is_valid(cfg: &RunnerConfig, cache: &ProjectCache) -> bool {
    if cache.root != cfg.workspace_root {
        return false;
    }
    if cache.root_digest != root_digest(&cfg.workspace_root) {
        return false;
    }
    let max_age = ChronoDuration::days(cfg.cache_max_age_days as i64);
    Utc::now().signed_duration_since(cache.scanned_at) <= max_age
}

fn root_digest(root: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}
