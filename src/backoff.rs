//! Exponential backoff between retry attempts.

use std::time::Duration;

use crate::error::ConfigError;

/// Capped exponential backoff.
///
/// The delay before retry `n` (0-based) is
/// `min(base_delay * exponential_base^n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
        }
    }
}

impl Backoff {
    /// Creates a backoff. `exponential_base` must be finite and at least 1.
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
    ) -> Result<Self, ConfigError> {
        if !exponential_base.is_finite() || exponential_base < 1.0 {
            return Err(ConfigError::InvalidExponentialBase(
                exponential_base.to_string(),
            ));
        }
        Ok(Self {
            base_delay,
            max_delay,
            exponential_base,
        })
    }

    /// Delay before the first retry.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound of every delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor between consecutive delays.
    pub fn exponential_base(&self) -> f64 {
        self.exponential_base
    }

    /// Delay to wait after the failed attempt with index `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // powi saturates to +inf for large exponents instead of wrapping
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);

        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) if secs.is_nan() || secs < 0.0 => Duration::ZERO,
            Err(_) => self.max_delay,
        }
    }
}
