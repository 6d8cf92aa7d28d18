//! Backoff — reconnect delays for a target's retry loop.

use std::time::Duration;

use rand::Rng;

use crate::conf::BackoffConfig;

/// Exponential delay: `min * 2^attempt`, capped at `max`. Jitter only ever
/// shortens a delay, so the cap holds.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            min: config.min_delay(),
            max: config.max_delay().max(config.min_delay()),
            jitter: config.jitter.clamp(0.0, 0.99),
            attempt: 0,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .min
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter <= 0.0 {
            return base;
        }
        let cut: f64 = rand::thread_rng().gen_range(0.0..self.jitter);
        base.mul_f64(1.0 - cut)
    }
}
