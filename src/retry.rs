//! Bounded retry with a fixed backoff schedule.
//!
//! Only image builds are retried; cluster, install and readiness failures
//! are fatal on first occurrence and recovered by re-running the bootstrap.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::process::{Cmd, CommandOutput, CommandRunner};

/// Source of blocking delays. Tests substitute a recorder.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Attempt `k` (1-indexed) failing sleeps `backoff[k-1]` before attempt `k+1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: [10, 30, 60].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt`. Schedules shorter than the
    /// attempt count reuse their last entry.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

pub struct RetryExecutor<'a> {
    runner: &'a dyn CommandRunner,
    sleeper: &'a dyn Sleeper,
    policy: RetryPolicy,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, sleeper: &'a dyn Sleeper, policy: RetryPolicy) -> Self {
        Self {
            runner,
            sleeper,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `cmd` until it exits zero or the policy is exhausted.
    pub fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let label = cmd.to_string();
        self.attempt(&label, |_| cmd.run(self.runner))
    }

    /// Retry an arbitrary operation under the policy.
    ///
    /// `op` receives the 1-indexed attempt number. Only the last failure is
    /// returned; earlier ones are logged.
    pub fn attempt<T>(&self, label: &str, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(label, attempt, max_attempts, "attempting");
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(label, attempt, error = %format!("{err:#}"), "attempt failed");
                    crate::console::warn(format!(
                        "{label}: attempt {attempt}/{max_attempts} failed, retrying in {}s",
                        delay.as_secs()
                    ));
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "{label}: giving up after {max_attempts} attempts"
                    )))
                }
            }
        }
    }
}
