//! Exponential-backoff parameters for relay reconnection.
//!
//! When the gateway's relay connection drops it waits
//! [`ReconnectConfig::initial_delay`], tries again, and multiplies the
//! delay after every failed attempt up to [`ReconnectConfig::max_delay`].

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Backoff state for one outage.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.initial_delay.min(config.max_delay);
        Self {
            config,
            delay,
            attempt: 0,
        }
    }

    /// Delay to wait before the upcoming attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Number of failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and grow the delay.
    pub fn fail(&mut self) {
        self.attempt += 1;
        self.delay = next_delay(self.delay, &self.config);
    }
}
