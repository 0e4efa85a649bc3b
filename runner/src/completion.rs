//! Smart completion checker: commits, session probes, commit rescue.
//!
//! Decides whether an iteration produced real progress, in strict signal
//! priority: new git commits first, then a bounded loop of session probes,
//! then commit rescue for uncommitted work, with one final rescue attempt
//! once the probe budget is exhausted.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelToken, sleep_with_cancel};
use crate::core::types::{CompletionOutcome, CompletionStatus};
use crate::io::config::CompletionConfig;
use crate::io::git::Git;
use crate::io::probe::{ProbeStatus, SessionProbe};
use crate::io::rescue::RescueRunner;

/// Consecutive failed probes tolerated before giving up with `ProbeError`.
const MAX_CONSECUTIVE_PROBE_FAILURES: u32 = 2;

pub struct CompletionChecker<'a> {
    probe: &'a dyn SessionProbe,
    rescue: &'a dyn RescueRunner,
    tunables: CompletionConfig,
}

impl<'a> CompletionChecker<'a> {
    pub fn new(
        probe: &'a dyn SessionProbe,
        rescue: &'a dyn RescueRunner,
        tunables: CompletionConfig,
    ) -> Self {
        Self {
            probe,
            rescue,
            tunables,
        }
    }

    /// Check whether the iteration since `baseline` is complete.
    ///
    /// Pure with respect to its inputs plus the external probe: reruns may
    /// differ only because of external side effects (commits, replies).
    #[instrument(skip_all, fields(spec_name))]
    pub fn check(
        &self,
        project: &Path,
        spec_name: &str,
        baseline: Option<&str>,
        cancel: &CancelToken,
    ) -> CompletionOutcome {
        let git = Git::new(project);
        let mut probes_used = 0u32;
        let mut rescued = false;
        let mut consecutive_failures = 0u32;

        for round in 0..self.tunables.max_probes {
            // Signal A: new commits end the check immediately.
            let new_commits = commits_since(&git, baseline);
            if new_commits > 0 {
                info!(new_commits, "work complete, commits detected");
                return outcome(true, new_commits, probes_used, rescued, CompletionStatus::CommitsCreated);
            }

            if cancel.is_cancelled() {
                return outcome(false, 0, probes_used, rescued, CompletionStatus::Timeout);
            }

            // Signal B: ask the session what it is doing.
            probes_used = round + 1;
            debug!(probe = probes_used, max = self.tunables.max_probes, "probing session");
            let reply = self.probe.probe(project);

            match reply.status {
                ProbeStatus::Complete => {
                    // Claims completion without commits: rescue any
                    // uncommitted work, otherwise there was nothing to do.
                    let dirty = git.dirty_paths().unwrap_or_default();
                    if dirty.is_empty() {
                        info!("session complete with a clean tree");
                        return outcome(true, 0, probes_used, rescued, CompletionStatus::NothingToDo);
                    }
                    info!(dirty_files = dirty.len(), "complete but uncommitted, rescuing");
                    if self.rescue.rescue(project, spec_name).ok {
                        rescued = true;
                        let new_commits = commits_since(&git, baseline);
                        if new_commits > 0 {
                            info!(new_commits, "rescue created commits");
                            return outcome(true, new_commits, probes_used, rescued, CompletionStatus::Rescued);
                        }
                    }
                    // Rescue failed; keep probing.
                }
                ProbeStatus::Waiting => {
                    info!(message = %reply.message, "session waiting on background work");
                }
                ProbeStatus::Working => {
                    info!(message = %reply.message, "session still working");
                }
                ProbeStatus::Error => {
                    warn!(message = %reply.message, "probe failed");
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_PROBE_FAILURES {
                        return outcome(false, 0, probes_used, rescued, CompletionStatus::ProbeError);
                    }
                }
            }
            if reply.status != ProbeStatus::Error {
                consecutive_failures = 0;
            }

            if reply.status != ProbeStatus::Error && !reply.should_continue {
                info!("session asked not to continue");
                return outcome(false, 0, probes_used, rescued, CompletionStatus::LlmStopped);
            }

            if round + 1 < self.tunables.max_probes {
                let interval = std::time::Duration::from_secs(self.tunables.probe_interval_s);
                if !sleep_with_cancel(interval, cancel) {
                    return outcome(false, 0, probes_used, rescued, CompletionStatus::Timeout);
                }
            }
        }

        warn!(max_probes = self.tunables.max_probes, "probe budget exhausted");

        // Final guard: one last rescue attempt for uncommitted work.
        if self.tunables.final_rescue {
            let dirty = git.dirty_paths().unwrap_or_default();
            if !dirty.is_empty() {
                info!(dirty_files = dirty.len(), "final rescue attempt");
                if self.rescue.rescue(project, spec_name).ok {
                    rescued = true;
                    let new_commits = commits_since(&git, baseline);
                    if new_commits > 0 {
                        return outcome(true, new_commits, probes_used, rescued, CompletionStatus::RescuedFinal);
                    }
                }
            }
        }

        outcome(false, 0, probes_used, rescued, CompletionStatus::Timeout)
    }
}

fn outcome(
    complete: bool,
    new_commits: u32,
    probes_used: u32,
    rescued: bool,
    status: CompletionStatus,
) -> CompletionOutcome {
    CompletionOutcome {
        complete,
        new_commits,
        probes_used,
        rescued,
        status,
    }
}

/// Commits created since the baseline; a missing baseline (repository had no
/// commits at session start) counts every commit as new.
fn commits_since(git: &Git, baseline: Option<&str>) -> u32 {
    let result = match baseline {
        Some(baseline) => git.new_commit_count(baseline),
        None => git.commit_count(),
    };
    result.unwrap_or_else(|err| {
        warn!(error = %err, "commit count failed");
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::probe::{ProbeReply, ProbeStatus};
    use crate::test_support::{ScriptedProbe, ScriptedRescue, TestRepo};

    fn fast_tunables(max_probes: u32) -> CompletionConfig {
        CompletionConfig {
            max_probes,
            probe_interval_s: 0,
            probe_timeout_s: 1,
            final_rescue: true,
        }
    }

    fn reply(status: ProbeStatus) -> ProbeReply {
        ProbeReply {
            status,
            message: String::new(),
            should_continue: true,
            agents_active: None,
            tasks_completed: Vec::new(),
            tasks_pending: Vec::new(),
        }
    }

    /// Commits already present at probe time finish the check with no probes.
    #[test]
    fn commits_short_circuit_before_any_probe() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");
        repo.commit_file("a.txt", "a", "feat: a").expect("commit");
        repo.commit_file("b.txt", "b", "feat: b").expect("commit");

        let probe = ScriptedProbe::new(vec![]);
        let rescue = ScriptedRescue::succeeding(|_| {});
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(5));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert!(outcome.complete);
        assert_eq!(outcome.status, CompletionStatus::CommitsCreated);
        assert_eq!(outcome.new_commits, 2);
        assert_eq!(outcome.probes_used, 0, "no probe may be issued");
        assert_eq!(probe.calls(), 0);
    }

    /// The probe budget is a hard cap.
    #[test]
    fn at_most_max_probes_are_issued() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");

        let probe = ScriptedProbe::repeating(reply(ProbeStatus::Working));
        let rescue = ScriptedRescue::failing();
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(3));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert_eq!(outcome.status, CompletionStatus::Timeout);
        assert_eq!(outcome.probes_used, 3);
        assert_eq!(probe.calls(), 3);
    }

    /// Complete + dirty tree + successful rescue = rescued completion.
    #[test]
    fn rescue_converts_dirty_tree_into_commits() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");
        std::fs::write(repo.root().join("wip1.txt"), "one").expect("write");
        std::fs::write(repo.root().join("wip2.txt"), "two").expect("write");

        let probe = ScriptedProbe::new(vec![reply(ProbeStatus::Complete)]);
        let repo_root = repo.root().to_path_buf();
        let rescue = ScriptedRescue::succeeding(move |_| {
            crate::test_support::git_commit_all(&repo_root, "chore: rescue uncommitted work");
        });
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(5));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert!(outcome.complete);
        assert!(outcome.rescued);
        assert_eq!(outcome.status, CompletionStatus::Rescued);
        assert_eq!(outcome.new_commits, 1);
    }

    /// Complete with a clean tree means there was nothing to do.
    #[test]
    fn complete_and_clean_reports_nothing_to_do() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");

        let probe = ScriptedProbe::new(vec![reply(ProbeStatus::Complete)]);
        let rescue = ScriptedRescue::failing();
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(5));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert!(outcome.complete);
        assert_eq!(outcome.status, CompletionStatus::NothingToDo);
    }

    #[test]
    fn consecutive_probe_failures_return_probe_error() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");

        let probe = ScriptedProbe::repeating(ProbeReply::error("boom"));
        let rescue = ScriptedRescue::failing();
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(5));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert_eq!(outcome.status, CompletionStatus::ProbeError);
        assert_eq!(outcome.probes_used, 2);
    }

    #[test]
    fn single_probe_failure_is_recovered() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");

        let mut stop = reply(ProbeStatus::Working);
        stop.should_continue = false;
        let probe = ScriptedProbe::new(vec![ProbeReply::error("transient"), stop]);
        let rescue = ScriptedRescue::failing();
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(5));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert_eq!(outcome.status, CompletionStatus::LlmStopped);
    }

    #[test]
    fn final_rescue_after_exhausted_probes() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");
        std::fs::write(repo.root().join("wip.txt"), "wip").expect("write");

        let probe = ScriptedProbe::repeating(reply(ProbeStatus::Working));
        let repo_root = repo.root().to_path_buf();
        let rescue = ScriptedRescue::succeeding(move |_| {
            crate::test_support::git_commit_all(&repo_root, "chore: final rescue");
        });
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(2));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert!(outcome.complete);
        assert_eq!(outcome.status, CompletionStatus::RescuedFinal);
        assert!(outcome.rescued);
    }

    #[test]
    fn failed_rescue_falls_through_to_timeout() {
        let repo = TestRepo::new().expect("repo");
        let baseline = repo.head().expect("head");
        std::fs::write(repo.root().join("wip.txt"), "wip").expect("write");

        let probe = ScriptedProbe::repeating(reply(ProbeStatus::Complete));
        let rescue = ScriptedRescue::failing();
        let checker = CompletionChecker::new(&probe, &rescue, fast_tunables(2));

        let outcome = checker.check(repo.root(), "demo", Some(&baseline), &CancelToken::new());
        assert!(!outcome.complete);
        assert_eq!(outcome.status, CompletionStatus::Timeout);
        assert!(!outcome.rescued);
    }
}
