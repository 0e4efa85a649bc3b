//! Smart-completion probe adapter.
//!
//! When an implementation session exits without commits, the checker asks
//! the provider one structured question about session state. The reply is
//! JSON, but providers wrap it unpredictably, so extraction is tolerant:
//! a fenced ```json block first, then a raw object containing `"status"`,
//! then the whole reply.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::io::process::run_command_with_timeout;
use crate::io::provider::ProviderKind;

const PROBE_OUTPUT_LIMIT: usize = 262_144;

pub const PROBE_PROMPT: &str = "\
STATUS PROBE - Respond in JSON only.

Analyze the current session state and respond with a single JSON object:

{
  \"status\": \"complete|waiting|working\",
  \"message\": \"Brief status description\",
  \"agents_active\": true,
  \"tasks_completed\": [\"Task X.Y completed\"],
  \"tasks_pending\": [\"Task X.Y still pending\"],
  \"should_continue\": true
}

Status values:
- \"complete\": all work done and committed, ready for the next iteration
- \"waiting\": background workers still running, need to wait
- \"working\": currently implementing tasks, need more time

RESPOND WITH ONLY THE JSON OBJECT. No other text.";

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex")
});

static RAW_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)(\{[^{}]*"status"[^{}]*\})"#).expect("raw status regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Complete,
    Waiting,
    Working,
    Error,
}

/// Structured probe reply. Optional fields are informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReply {
    pub status: ProbeStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_true")]
    pub should_continue: bool,
    #[serde(default)]
    pub agents_active: Option<bool>,
    #[serde(default)]
    pub tasks_completed: Vec<String>,
    #[serde(default)]
    pub tasks_pending: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ProbeReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Error,
            message: message.into(),
            should_continue: false,
            agents_active: None,
            tasks_completed: Vec::new(),
            tasks_pending: Vec::new(),
        }
    }
}

/// One call to the external completion-probe collaborator.
///
/// Implementations never fail: every failure mode collapses into a reply
/// with `status == Error`, which the checker counts against its budget.
pub trait SessionProbe {
    fn probe(&self, project: &Path) -> ProbeReply;
}

/// Production probe: shells out to the provider CLI.
#[derive(Debug, Clone)]
pub struct CliSessionProbe {
    provider: ProviderKind,
    model: String,
    timeout: Duration,
}

impl CliSessionProbe {
    pub fn new(provider: ProviderKind, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout,
        }
    }
}

impl SessionProbe for CliSessionProbe {
    fn probe(&self, project: &Path) -> ProbeReply {
        let argv = self.provider.probe_argv(PROBE_PROMPT, &self.model);
        let (program, args) = match argv.split_first() {
            Some(parts) => parts,
            None => return ProbeReply::error("empty probe command"),
        };

        let mut cmd = std::process::Command::new(program);
        cmd.args(args).current_dir(project);
        let output = match run_command_with_timeout(cmd, None, self.timeout, PROBE_OUTPUT_LIMIT) {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "probe subprocess failed to run");
                return ProbeReply::error(format!("probe failed: {err}"));
            }
        };
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "probe timed out");
            return ProbeReply::error("probe timeout");
        }

        let reply = parse_reply(&output.stdout_text());
        debug!(status = ?reply.status, "probe reply");
        reply
    }
}

/// Parse a provider reply into a `ProbeReply`, tolerating markdown wrapping.
pub fn parse_reply(output: &str) -> ProbeReply {
    let candidate = extract_json(output);
    match serde_json::from_str::<ProbeReply>(&candidate) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(error = %err, "could not parse probe reply");
            ProbeReply::error(format!("could not parse JSON response: {err}"))
        }
    }
}

/// Pull the most plausible JSON object out of a reply.
fn extract_json(output: &str) -> String {
    if let Some(caps) = FENCED_JSON_RE.captures(output) {
        return caps[1].to_string();
    }
    if let Some(caps) = RAW_STATUS_RE.captures(output) {
        return caps[1].to_string();
    }
    output.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_reply() {
        let reply = parse_reply(r#"{"status": "working", "message": "on task 2"}"#);
        assert_eq!(reply.status, ProbeStatus::Working);
        assert_eq!(reply.message, "on task 2");
        assert!(reply.should_continue, "should_continue defaults to true");
    }

    #[test]
    fn extracts_json_from_triple_backtick_fence() {
        let output = "Here is my status:\n```json\n{\"status\": \"complete\", \"should_continue\": false}\n```\nDone.";
        let reply = parse_reply(output);
        assert_eq!(reply.status, ProbeStatus::Complete);
        assert!(!reply.should_continue);
    }

    #[test]
    fn extracts_raw_object_containing_status() {
        let output = "preamble text {\"status\": \"waiting\", \"message\": \"agents busy\"} trailer";
        let reply = parse_reply(output);
        assert_eq!(reply.status, ProbeStatus::Waiting);
        assert_eq!(reply.message, "agents busy");
    }

    #[test]
    fn malformed_reply_becomes_error_status() {
        let reply = parse_reply("I can't answer in JSON right now.");
        assert_eq!(reply.status, ProbeStatus::Error);
        assert!(!reply.should_continue);
    }

    #[test]
    fn optional_task_lists_are_tolerated() {
        let reply = parse_reply(
            r#"{"status": "complete", "tasks_completed": ["Task 1.1 completed"], "agents_active": false}"#,
        );
        assert_eq!(reply.tasks_completed, vec!["Task 1.1 completed"]);
        assert_eq!(reply.agents_active, Some(false));
    }
}
