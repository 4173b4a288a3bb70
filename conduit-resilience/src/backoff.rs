//! Exponential backoff with symmetric jitter

use rand::Rng;
use std::time::Duration;

/// Backoff delay calculator
///
/// The base delay for attempt `n` (1-indexed) is
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`. Jitter then
/// perturbs it by a uniformly random fraction in `[-jitter, +jitter]` and the
/// result is clamped to `[0, max_delay]`.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffCalculator {
    /// Create a new backoff calculator without jitter
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction, clamped to `[0, 1]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);

        if self.jitter == 0.0 || base.is_zero() {
            base
        } else {
            self.add_jitter(base)
        }
    }

    /// Capped exponential delay before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let offset = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = delay.as_nanos() as f64 * (1.0 + offset);
        let clamped = jittered.clamp(0.0, self.max_delay.as_nanos() as f64);
        Duration::from_nanos(clamped.round() as u64)
    }
}
