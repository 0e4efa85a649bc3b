//! Structured product event log.
//!
//! JSON-per-line artifacts, distinct from `tracing` dev diagnostics: these
//! are always written regardless of `RUST_LOG` and are meant to be consumed
//! by tooling. Each line carries `ts`, `level`, `event`, and a `ctx` object
//! with secret values redacted by key.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static SECRET_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(api[-_]?key|token|secret|authorization|password)").expect("secret key regex")
});

const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Size-rotated JSON event sink. Writes are serialized internally; the file
/// is opened per write so rotation never races an open handle.
#[derive(Debug)]
pub struct EventLogger {
    path: PathBuf,
    max_bytes: u64,
    max_backups: u32,
    write_lock: Mutex<()>,
}

impl EventLogger {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_backups: u32) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            max_backups,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line. Failures are returned, not panicked; callers
    /// treat event-log write failures as best-effort.
    pub fn log(&self, level: Level, event: &str, ctx: Value) -> Result<()> {
        let line = serde_json::json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": level,
            "event": event,
            "ctx": redact(ctx),
        });

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("append event log {}", self.path.display()))?;
        drop(file);

        self.rotate_if_needed()?;
        Ok(())
    }

    pub fn info(&self, event: &str, ctx: Value) {
        self.best_effort(Level::Info, event, ctx);
    }

    pub fn warn(&self, event: &str, ctx: Value) {
        self.best_effort(Level::Warn, event, ctx);
    }

    pub fn error(&self, event: &str, ctx: Value) {
        self.best_effort(Level::Error, event, ctx);
    }

    fn best_effort(&self, level: Level, event: &str, ctx: Value) {
        if let Err(err) = self.log(level, event, ctx) {
            tracing::warn!(error = %err, event, "event log write failed");
        }
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        // Shift backups upward, dropping the oldest.
        for n in (1..self.max_backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))
                    .with_context(|| format!("rotate {}", from.display()))?;
            }
        }
        if self.max_backups > 0 {
            fs::rename(&self.path, self.backup_path(1))
                .with_context(|| format!("rotate {}", self.path.display()))?;
        } else {
            fs::remove_file(&self.path)
                .with_context(|| format!("truncate {}", self.path.display()))?;
        }
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "events.log".to_string());
        name.push_str(&format!(".{n}"));
        self.path.with_file_name(name)
    }
}

/// Replace values of secret-looking keys, recursively.
fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    if SECRET_KEY_RE.is_match(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
