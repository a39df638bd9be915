// src/exec/retry.rs

//! Retry policy with exponential backoff.

use std::time::Duration;

/// How often to attempt a unit of work and how long to wait in between.
///
/// The delay after failed attempt `n` (1-based) is
/// `base_delay * multiplier^(n-1)`, capped at `max_delay` when set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: None,
        }
    }
}

impl RetryConfig {
    /// Policy allowing `limit` attempts in total.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            max_attempts: limit.max(1),
            ..Self::default()
        }
    }

    /// Policy allowing `max_retries` retries after the first attempt.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::with_limit(max_retries.saturating_add(1))
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = Some(cap);
        self
    }

    /// Attempts, clamped to at least one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn max_retries(&self) -> u32 {
        self.attempts() - 1
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let factor = if self.multiplier.is_finite() && self.multiplier > 0.0 {
            self.multiplier.powi(exp)
        } else {
            1.0
        };
        let mut nanos = self.base_delay.as_nanos() as f64 * factor;
        if let Some(cap) = self.max_delay {
            nanos = nanos.min(cap.as_nanos() as f64);
        }
        if !nanos.is_finite() || nanos < 0.0 {
            return self.max_delay.unwrap_or(self.base_delay);
        }
        Duration::from_nanos(nanos.round().min(u64::MAX as f64) as u64)
    }
}
