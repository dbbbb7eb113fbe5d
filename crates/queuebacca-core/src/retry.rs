// Retry-delay strategies applied when a message is returned to its bin.
use std::time::Duration;

use crate::client::MAX_DELAY;

/// Computes how long a retried message stays invisible, from the broker's
/// read count for the delivery.
pub trait RetryDelayGenerator: Send + Sync + 'static {
    fn next_delay(&self, read_count: u32) -> Duration;
}

/// The same delay for every retry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantRetryDelay {
    delay: Duration,
}

impl ConstantRetryDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryDelayGenerator for ConstantRetryDelay {
    fn next_delay(&self, _read_count: u32) -> Duration {
        self.delay
    }
}

/// `min(cap, base * factor^(read_count - 1))`, in whole seconds.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialRetryDelay {
    base: Duration,
    factor: u32,
    cap: Duration,
}

impl ExponentialRetryDelay {
    pub fn new(base: Duration, factor: u32, cap: Duration) -> Self {
        Self { base, factor, cap }
    }
}

impl RetryDelayGenerator for ExponentialRetryDelay {
    fn next_delay(&self, read_count: u32) -> Duration {
        let exponent = read_count.saturating_sub(1);
        let scale = (self.factor as u64)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let seconds = self.base.as_secs().saturating_mul(scale);
        Duration::from_secs(seconds).min(self.cap)
    }
}

/// Clamp a generated delay to the broker's accepted range. The broker
/// takes whole seconds; sub-second remainders are dropped.
pub(crate) fn clamp_delay(delay: Duration) -> Duration {
    Duration::from_secs(delay.as_secs()).min(MAX_DELAY)
}
