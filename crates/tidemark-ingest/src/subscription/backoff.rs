//! Delay policies.
//!
//! [`RetryPolicy`] spaces out full supervisor cycles (lease, connect, consume).
//! [`Reconnector`] paces transport reconnects inside one cycle with
//! exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Fixed delay with symmetric jitter between supervisor retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    /// Maximum deviation from `base`, in either direction.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5000),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay drawn from `rng`, uniform in `base ± jitter`.
    pub fn delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let base = self.base.as_millis() as i64;
        let max = self.jitter.as_millis() as i64;
        let offset = ((rng.r#gen::<f64>() - 0.5) * max as f64 * 2.0).round() as i64;
        Duration::from_millis((base + offset).max(0) as u64)
    }

    pub fn delay(&self) -> Duration {
        self.delay_with(&mut rand::thread_rng())
    }
}

/// Exponential-backoff policy for transport reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// `None` means retry indefinitely.
    pub max_retries: Option<u32>,
    /// Randomize each delay by up to ±25%.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            backoff_multiplier: 2.0,
            max_retries: None,
            jitter: true,
        }
    }
}

/// Reconnect attempt counter and delay schedule.
#[derive(Debug)]
pub struct Reconnector {
    config: ReconnectConfig,
    attempt: u32,
    current_delay: Duration,
}

impl Reconnector {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            current_delay,
        }
    }

    /// Reconnects since the last successful message.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries_exceeded(&self) -> bool {
        self.config
            .max_retries
            .is_some_and(|max| self.attempt >= max)
    }

    /// Reset after the connection delivered data again.
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            tracing::debug!(attempts = self.attempt, "Connection healthy, reset reconnect state");
        }
        self.attempt = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.max_retries_exceeded() {
            return None;
        }
        self.attempt += 1;

        let delay = self.current_delay;
        let delay = if self.config.jitter {
            let ms = delay.as_millis() as f64;
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            Duration::from_millis((ms * factor).max(1.0) as u64)
        } else {
            delay
        };

        let next_ms = (self.current_delay.as_millis() as f64 * self.config.backoff_multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(self.config.max_delay);

        Some(delay)
    }
}
