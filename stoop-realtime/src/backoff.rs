//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;
use stoop_core::ReconnectConfig;

/// Exponential reconnect delay with additive jitter.
///
/// Counts consecutive failures; [`Backoff::reset`] after a successful
/// connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current_ms: u64,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_ms = config.initial_ms;
        Self {
            config,
            current_ms,
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True once the configured attempt ceiling is reached. A ceiling of
    /// zero never exhausts.
    pub fn is_exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.failures >= self.config.max_attempts
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = jittered(self.current_ms, self.config.jitter_ms);
        let next = (self.current_ms as f64 * self.config.multiplier) as u64;
        self.current_ms = next.min(self.config.max_ms).max(self.config.initial_ms);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_ms;
        self.failures = 0;
    }
}

fn jittered(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    base_ms.saturating_add(rand::rng().random_range(0..jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter_ms: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_ms,
            max_attempts,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(config(0, 0));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert!(!backoff.is_exhausted());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::new(config(50, 0));
        let first = backoff.next_delay().as_millis() as u64;
        assert!((100..150).contains(&first));
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut backoff = Backoff::new(config(0, 2));
        backoff.next_delay();
        assert!(!backoff.is_exhausted());
        backoff.next_delay();
        assert!(backoff.is_exhausted());

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
