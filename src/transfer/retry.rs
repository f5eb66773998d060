//! Bounded retry with linearly growing delays.

use std::time::Duration;

use backon::BackoffBuilder;

/// Retry policy waiting `step * n` before the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearRetry {
    pub max_retries: usize,
    pub step: Duration,
}

impl Default for LinearRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step: Duration::from_secs(2),
        }
    }
}

impl LinearRetry {
    /// Delay before retry number `retry` (1-based), `None` past the cap.
    pub fn delay_for(&self, retry: usize) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }

        let factor = u32::try_from(retry).unwrap_or(u32::MAX);
        Some(self.step.saturating_mul(factor))
    }
}

/// Iterator of delays produced by [`LinearRetry`].
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    policy: LinearRetry,
    retries: usize,
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.retries + 1)?;
        self.retries += 1;
        Some(delay)
    }
}

impl BackoffBuilder for LinearRetry {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff {
            policy: self,
            retries: 0,
        }
    }
}
