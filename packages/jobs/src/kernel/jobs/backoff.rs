use std::time::Duration;

/// Lower bound of the jitter factor applied to each delay.
pub const JITTER_MIN: f64 = 0.75;
/// Upper bound of the jitter factor applied to each delay.
pub const JITTER_MAX: f64 = 1.25;

const MIN_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff with jitter for retrying failed jobs.
///
/// `delay(k) = min(max_delay, base_delay * 2^(k-1))`, scaled by a factor drawn
/// uniformly from [0.75, 1.25] and floored at one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after attempt `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        let factor = 2u32.saturating_pow(exponent);

        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying after attempt `attempt`, with jitter applied.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let factor = JITTER_MIN + fastrand::f64() * (JITTER_MAX - JITTER_MIN);
        self.jittered(attempt, factor)
    }

    fn jittered(&self, attempt: i32, factor: f64) -> Duration {
        self.base_delay_for(attempt).mul_f64(factor).max(MIN_DELAY)
    }
}
