//! Retry utilities: backoff builders for `backon`.
//!
//! Broker connection retries wait linearly longer after each failure:
//! `1 × base`, `2 × base`, ... until the attempt budget is spent.

use std::time::Duration;

use backon::BackoffBuilder;

use crate::config::BrokerConfig;

/// Linear backoff: the wait after failed attempt `n` is `n × base`.
///
/// `max_attempts` counts every attempt, the first included, so the
/// built backoff yields `max_attempts - 1` delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    base: Duration,
    max_attempts: u32,
}

impl LinearBackoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Backoff for broker connection retries at startup.
///
/// - Base delay: `retry_base_delay_ms` (1s by default)
/// - Max attempts: `max_attempts` (5 by default)
/// - No jitter
pub fn connection_backoff(config: &BrokerConfig) -> LinearBackoff {
    LinearBackoff::new(config.retry_base_delay(), config.max_attempts)
}

impl BackoffBuilder for LinearBackoff {
    type Backoff = LinearDelays;

    fn build(self) -> Self::Backoff {
        LinearDelays {
            base: self.base,
            max_attempts: self.max_attempts,
            attempt: 0,
        }
    }
}

/// Delay sequence produced by `LinearBackoff`.
#[derive(Debug, Clone)]
pub struct LinearDelays {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Iterator for LinearDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.max_attempts {
            return None;
        }
        Some(self.base.saturating_mul(self.attempt))
    }
}
