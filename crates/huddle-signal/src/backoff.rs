use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential reconnect schedule: `base * 2^attempt`, with `attempt`
/// capped at `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
    /// Fraction of the computed delay that may be added at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Deterministic delay for `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay before retry number `attempt`, or `None` once the caller must
    /// stop retrying and report a permanent failure.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        if self.exhausted(attempt) {
            return None;
        }
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return Some(delay);
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        Some(delay.saturating_add(delay.mul_f64(spread)))
    }
}
