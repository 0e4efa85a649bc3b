//! AI provider adapter: argv construction and health checks.
//!
//! Providers are a closed set. The core passes model names through opaquely
//! and never interprets provider output itself; the only provider-specific
//! knowledge is how to build a command line and how to check that the
//! provider's auxiliary integration is available.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::process::run_command_with_timeout;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    Codex,
    Gemini,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "claude" => Ok(ProviderKind::Claude),
            "codex" => Ok(ProviderKind::Codex),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(anyhow!(
                "unknown provider '{other}' (expected claude, codex, or gemini)"
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn supported_models(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::Claude => &["sonnet", "haiku", "opus"],
            ProviderKind::Codex => &[
                "gpt-5.1-codex-max",
                "gpt-5.1-codex",
                "gpt-5.1-codex-mini",
                "gpt-5-codex",
            ],
            ProviderKind::Gemini => &[
                "gemini-3-pro-preview",
                "gemini-2.5-pro",
                "gemini-2.5-flash",
            ],
        }
    }

    pub fn default_model(&self) -> &'static str {
        self.supported_models()[0]
    }

    /// Build the implementation-session command line. Pure.
    pub fn build_argv(
        &self,
        prompt: &str,
        model: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Vec<String> {
        match self {
            ProviderKind::Claude => vec![
                "claude".to_string(),
                "--print".to_string(),
                "--model".to_string(),
                model.to_string(),
                "--dangerously-skip-permissions".to_string(),
                prompt.to_string(),
            ],
            ProviderKind::Codex => {
                let mut argv = vec![
                    "codex".to_string(),
                    "e".to_string(),
                    "--dangerously-bypass-approvals-and-sandbox".to_string(),
                    "--model".to_string(),
                    model.to_string(),
                ];
                for (key, value) in overrides {
                    argv.push("-c".to_string());
                    argv.push(format!("{key}={value}"));
                }
                argv.push(prompt.to_string());
                argv
            }
            ProviderKind::Gemini => vec![
                "gemini".to_string(),
                "--model".to_string(),
                model.to_string(),
                "--yolo".to_string(),
                "--prompt".to_string(),
                prompt.to_string(),
            ],
        }
    }

    /// Command line for a session status probe.
    ///
    /// Claude resumes the previous session with `--continue`; the other
    /// providers answer the probe in a fresh session.
    pub fn probe_argv(&self, probe_prompt: &str, model: &str) -> Vec<String> {
        match self {
            ProviderKind::Claude => vec![
                "claude".to_string(),
                "--print".to_string(),
                "--model".to_string(),
                model.to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--continue".to_string(),
                probe_prompt.to_string(),
            ],
            _ => self.build_argv(probe_prompt, model, &BTreeMap::new()),
        }
    }

    /// Best-effort provider health check, run before spawning a session.
    ///
    /// Codex requires its MCP integration to answer; the other providers
    /// have no auxiliary dependency to verify.
    pub fn health_check(&self, project: &Path) -> Result<()> {
        match self {
            ProviderKind::Codex => {
                let mut cmd = Command::new("codex");
                cmd.args(["mcp", "list"]).current_dir(project);
                let output =
                    run_command_with_timeout(cmd, None, HEALTH_CHECK_TIMEOUT, 65_536)
                        .map_err(|err| anyhow!("codex health check failed to run: {err}"))?;
                if output.timed_out {
                    return Err(anyhow!("codex mcp list timed out"));
                }
                if !output.status.success() {
                    return Err(anyhow!(
                        "codex mcp list failed: {}",
                        output.stderr_text().trim()
                    ));
                }
                debug!("codex mcp integration present");
                Ok(())
            }
            ProviderKind::Claude | ProviderKind::Gemini => Ok(()),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable argv substring used together with the PID to defeat PID reuse.
pub fn cmd_fingerprint(argv: &[String]) -> String {
    argv.iter()
        .take(2)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}
