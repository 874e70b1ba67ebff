use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy after checking whether a
/// terminated process is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Process is gone: stop.
    Done,
    /// Process still present: wait and try again (1-based attempt number of the next try).
    Retry { attempt: u32 },
    /// Exhausted all attempts with the process still present.
    GiveUp,
}

/// Retry policy for terminating a tracked process.
///
/// Counts termination attempts and decides, after each one, whether to try
/// again. The first attempt counts against `max_attempts`.
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            current_attempt: 0,
        }
    }

    /// Record one termination attempt and decide what to do next.
    pub fn evaluate(&mut self, pid: u32, still_running: bool) -> RetryDecision {
        self.current_attempt += 1;

        if !still_running {
            return RetryDecision::Done;
        }

        if self.current_attempt < self.max_attempts {
            warn!(
                pid,
                attempt = self.current_attempt,
                max_attempts = self.max_attempts,
                "process survived termination, retrying"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt + 1,
            }
        } else {
            warn!(
                pid,
                max_attempts = self.max_attempts,
                "termination attempts exhausted"
            );
            RetryDecision::GiveUp
        }
    }

    /// Delay to wait before the next attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Attempts made so far (0 = none yet).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}
