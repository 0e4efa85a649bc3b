//! Runtime configuration (TOML).
//!
//! This file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values; unknown keys are
//! ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::retry::RetryPolicy;
use crate::core::tasks::MockPatterns;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root directory scanned for projects.
    pub workspace_root: PathBuf,

    /// Directory name that marks a project (e.g. `.spec-workflow`).
    pub workflow_dir_name: String,

    /// Subdirectory of the workflow dir holding specs.
    pub specs_subdir: String,

    /// Task checklist filename within each spec directory.
    pub tasks_filename: String,

    /// Per-spec log directory name under the workflow dir.
    pub log_dir_name: String,

    /// Poller interval in seconds.
    pub poll_interval_s: u64,

    /// Bytes of log tail read per poll.
    pub log_tail_bytes: u64,

    /// UI hints, passed through to consumers.
    pub min_terminal_cols: u16,
    pub min_terminal_rows: u16,

    /// Consecutive no-progress iterations before the driver halts.
    pub no_commit_limit: u32,

    pub commit_gate_enabled: bool,
    pub three_phase_enabled: bool,

    /// Cache directory for runner state and the project discovery cache.
    pub cache_dir: PathBuf,
    pub cache_max_age_days: u64,

    /// Regexes classifying declared files as mock/test-only.
    pub mock_only_path_patterns: Vec<String>,

    /// Argv for the external commit-rescue collaborator; empty disables it.
    pub rescue_command: Vec<String>,

    /// Opaque pass-through to the provider adapter.
    pub provider_config_overrides: BTreeMap<String, String>,

    pub retry: RetryConfig,
    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_s: u64,
    pub multiplier: f64,
    pub cap_s: u64,
    pub on_crash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompletionConfig {
    pub max_probes: u32,
    pub probe_interval_s: u64,
    pub probe_timeout_s: u64,
    pub final_rescue: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_s: 5,
            multiplier: 2.0,
            cap_s: 300,
            on_crash: true,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_probes: 5,
            probe_interval_s: 30,
            probe_timeout_s: 60,
            final_rescue: true,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: home_relative("repos"),
            workflow_dir_name: ".spec-workflow".to_string(),
            specs_subdir: "specs".to_string(),
            tasks_filename: "tasks.md".to_string(),
            log_dir_name: "logs".to_string(),
            poll_interval_s: 2,
            log_tail_bytes: 65_536,
            min_terminal_cols: 80,
            min_terminal_rows: 24,
            no_commit_limit: 3,
            commit_gate_enabled: true,
            three_phase_enabled: true,
            cache_dir: home_relative(".cache/spec-runner"),
            cache_max_age_days: 7,
            mock_only_path_patterns: MockPatterns::default_patterns(),
            rescue_command: Vec::new(),
            provider_config_overrides: BTreeMap::new(),
            retry: RetryConfig::default(),
            completion: CompletionConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_s == 0 {
            return Err(anyhow!("poll_interval_s must be > 0"));
        }
        if self.log_tail_bytes == 0 {
            return Err(anyhow!("log_tail_bytes must be > 0"));
        }
        if self.no_commit_limit == 0 {
            return Err(anyhow!("no_commit_limit must be > 0"));
        }
        if self.completion.max_probes == 0 {
            return Err(anyhow!("completion.max_probes must be > 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(anyhow!("retry.multiplier must be >= 1.0"));
        }
        if self.tasks_filename.trim().is_empty() {
            return Err(anyhow!("tasks_filename must not be empty"));
        }
        MockPatterns::compile(&self.mock_only_path_patterns)
            .map_err(|err| anyhow!("invalid mock_only_path_patterns: {err}"))?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.retry.on_crash,
            max_retries: self.retry.max_retries,
            base: Duration::from_secs(self.retry.base_backoff_s),
            multiplier: self.retry.multiplier,
            cap: Duration::from_secs(self.retry.cap_s),
        }
    }

    pub fn mock_patterns(&self) -> MockPatterns {
        MockPatterns::compile(&self.mock_only_path_patterns)
            .unwrap_or_else(|_| MockPatterns::default())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    /// Stable digest of the restart-relevant configuration.
    ///
    /// Persisted runner records carry this hash; a restored record whose hash
    /// no longer matches is treated as stopped.
    pub fn config_hash(&self) -> String {
        let relevant = serde_json::json!({
            "workspace_root": self.workspace_root,
            "workflow_dir_name": self.workflow_dir_name,
            "specs_subdir": self.specs_subdir,
            "tasks_filename": self.tasks_filename,
            "retry": {
                "max_retries": self.retry.max_retries,
                "base_backoff_s": self.retry.base_backoff_s,
                "multiplier": self.retry.multiplier,
                "cap_s": self.retry.cap_s,
                "on_crash": self.retry.on_crash,
            },
            "provider_config_overrides": self.provider_config_overrides,
        });
        let mut hasher = Sha256::new();
        hasher.update(relevant.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Per-spec log directory within a project.
    pub fn spec_log_dir(&self, project: &Path, spec_name: &str) -> PathBuf {
        project
            .join(&self.workflow_dir_name)
            .join(&self.log_dir_name)
            .join(spec_name)
    }

    /// Path to a spec's task document within a project.
    pub fn tasks_path(&self, project: &Path, spec_name: &str) -> PathBuf {
        project
            .join(&self.workflow_dir_name)
            .join(&self.specs_subdir)
            .join(spec_name)
            .join(&self.tasks_filename)
    }

    pub fn runner_state_path(&self) -> PathBuf {
        self.cache_dir.join("runner_state.json")
    }

    pub fn project_cache_path(&self) -> PathBuf {
        self.cache_dir.join("projects.json")
    }
}

fn home_relative(suffix: &str) -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(suffix),
        None => PathBuf::from(suffix),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.no_commit_limit = 5;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "no_commit_limit = 4\nsome_future_knob = true\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.no_commit_limit, 4);
    }

    #[test]
    fn config_hash_tracks_retry_changes_only() {
        let base = RunnerConfig::default();
        let mut retry_changed = base.clone();
        retry_changed.retry.max_retries = 9;
        let mut cosmetic_changed = base.clone();
        cosmetic_changed.min_terminal_cols = 120;

        assert_ne!(base.config_hash(), retry_changed.config_hash());
        assert_eq!(base.config_hash(), cosmetic_changed.config_hash());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let cfg = RunnerConfig {
            poll_interval_s: 0,
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_mock_pattern() {
        let cfg = RunnerConfig {
            mock_only_path_patterns: vec!["(unclosed".to_string()],
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
