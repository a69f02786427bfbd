//! Capped exponential backoff with jitter for reconnection.
//!
//! Delay for attempt `n` is `min(max, base * 2^n) + jitter`, clamped to
//! `max` and never shorter than the previous delay. A successful connection
//! resets the sequence.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Doubling stops here; `base * 2^16` already exceeds any sane cap.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let exp = self.config.base.saturating_mul(1 << self.attempt.min(MAX_EXPONENT));
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };

        let delay = exp
            .min(self.config.max)
            .saturating_add(jitter)
            .min(self.config.max)
            .max(self.last);

        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
