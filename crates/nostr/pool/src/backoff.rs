//! Exponential backoff for relay reconnects.

use std::time::Duration;

/// Doubling delay between reconnect attempts, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    /// 0 = unlimited
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    ///
    /// Never returns a zero delay, so a reconnect loop cannot spin.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts != 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let delay = self
            .initial_delay
            .max(Duration::from_millis(1))
            .saturating_mul(factor)
            .min(self.max_delay.max(Duration::from_millis(1)));
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
