//! Retry policy: pure exponential backoff with a cap.

use std::time::Duration;

/// Backoff policy for restarting crashed session subprocesses.
///
/// The policy only computes delays and decisions; the runner manager owns
/// the actual scheduling and honors cancellation during the wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Master switch; disabled means crashed runners are never restarted.
    pub enabled: bool,
    /// Maximum number of restarts after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first restart.
    pub base: Duration,
    /// Exponential multiplier applied per restart.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base: Duration::from_secs(5),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before restart number `retry_count + 1`.
    ///
    /// `backoff(0)` is the delay after the first crash.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = self.multiplier.powi(retry_count.min(i32::MAX as u32) as i32);
        let secs = self.base.as_secs_f64() * factor;
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether a runner with `retry_count` restarts so far should restart
    /// again after exiting with `exit_code`.
    pub fn should_retry(&self, retry_count: u32, exit_code: Option<i32>) -> bool {
        self.enabled && retry_count < self.max_retries && exit_code != Some(0)
    }
}
