//! Filesystem probes: mtime polling, log tailing, process liveness.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

use crate::core::tasks::FileProbe;
use crate::io::process::run_command_with_timeout;

/// Modification time of a file, `None` when it does not exist or cannot be
/// statted.
pub fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Read the last `max_bytes` bytes of a file.
///
/// Lossy on rotation: if the file shrank since the last read the caller
/// simply observes the new, shorter content. Consumers must accept
/// truncation.
pub fn tail(path: &Path, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Check whether `pid` is alive *and* its command line contains
/// `fingerprint`. A bare PID match is insufficient: if the PID was reused by
/// an unrelated process the fingerprint mismatch reports it dead.
pub fn pid_alive(pid: i32, fingerprint: &str) -> bool {
    if !pid_exists(pid) {
        return false;
    }
    match read_cmdline(pid) {
        Some(cmdline) => cmdline.contains(fingerprint),
        None => {
            debug!(pid, "could not read cmdline for liveness fingerprint");
            false
        }
    }
}

/// Signal-0 existence check. EPERM still means the process exists.
fn pid_exists(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_cmdline(pid: i32) -> Option<String> {
    let proc_path = PathBuf::from(format!("/proc/{pid}/cmdline"));
    if let Ok(raw) = fs::read(&proc_path) {
        let joined = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).to_string())
            .collect::<Vec<_>>()
            .join(" ");
        return Some(joined);
    }
    // Fallback for hosts without procfs.
    let mut cmd = Command::new("ps");
    cmd.args(["-p", &pid.to_string(), "-o", "args="]);
    let output = run_command_with_timeout(cmd, None, Duration::from_secs(10), 65_536).ok()?;
    if !output.status.success() {
        return None;
    }
    Some(output.stdout_text().trim().to_string())
}

/// File-existence probe rooted at a project directory, used by the task
/// document rewrites.
#[derive(Debug, Clone)]
pub struct WorkspaceProbe {
    root: PathBuf,
}

impl WorkspaceProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileProbe for WorkspaceProbe {
    fn exists(&self, workspace_relative: &str) -> bool {
        self.root.join(workspace_relative).is_file()
    }
}
