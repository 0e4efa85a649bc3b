//! Manager scenarios with real (short-lived) child processes.

use std::time::Duration;

use spec_runner::cancel::CancelToken;
use spec_runner::core::types::RunnerStatus;
use spec_runner::io::persist::load_runner_state;
use spec_runner::test_support::{TestRepo, launch_with, manager_for};

/// A successful session is observed, logged, and cleared from persistence.
#[test]
fn supervised_child_output_lands_in_its_log_file() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks("demo", "- [ ] 1. Todo\n").expect("tasks");
    let manager = manager_for(&repo);

    let record = manager
        .start(
            repo.root(),
            "demo",
            launch_with(&["sh", "-c", "echo session output"]),
        )
        .expect("start");
    let exit = manager
        .wait_for_exit(record.id, &CancelToken::new())
        .expect("wait");

    assert_eq!(exit.status, RunnerStatus::Completed);
    let log = std::fs::read_to_string(&record.log_path).expect("log");
    assert!(log.contains("session output"));

    // Terminal records leave the persisted active set.
    let state = load_runner_state(&manager.config().runner_state_path());
    assert!(state.runners.is_empty());
}

/// Crashes burn the retry budget with a fresh log per attempt, then land in
/// a terminal crashed state carrying the final exit code.
#[test]
fn crash_retries_then_reports_final_exit_code() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks("demo", "- [ ] 1. Todo\n").expect("tasks");
    let manager = manager_for(&repo);

    let record = manager
        .start(repo.root(), "demo", launch_with(&["sh", "-c", "exit 3"]))
        .expect("start");
    let exit = manager
        .wait_for_exit(record.id, &CancelToken::new())
        .expect("wait");

    assert_eq!(exit.status, RunnerStatus::Crashed);
    assert_eq!(exit.exit_code, Some(3));
    assert_eq!(exit.retry_count, 2);
}

/// A child that ignores SIGTERM is escalated to SIGKILL within the grace
/// window.
#[test]
fn stop_escalates_to_sigkill_for_stubborn_children() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks("demo", "- [ ] 1. Todo\n").expect("tasks");
    let manager = manager_for(&repo);

    let record = manager
        .start(
            repo.root(),
            "demo",
            launch_with(&["sh", "-c", "trap '' TERM; sleep 30"]),
        )
        .expect("start");

    let started = std::time::Instant::now();
    manager
        .stop(record.id, Duration::from_millis(300))
        .expect("stop");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop must not wait out the child's sleep"
    );
    assert_eq!(manager.status(record.id), Some(RunnerStatus::Stopped));
}

/// Cancellation during a wait stops the session and reports stopped.
#[test]
fn cancel_during_wait_stops_the_session() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks("demo", "- [ ] 1. Todo\n").expect("tasks");
    let manager = manager_for(&repo);

    let record = manager
        .start(repo.root(), "demo", launch_with(&["sleep", "30"]))
        .expect("start");

    let cancel = CancelToken::new();
    cancel.cancel();
    let exit = manager.wait_for_exit(record.id, &cancel).expect("wait");
    assert_eq!(exit.status, RunnerStatus::Stopped);
}
