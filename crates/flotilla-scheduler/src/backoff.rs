//! Reconnect pacing.
//!
//! The delay starts at zero, so the first reconnect after a healthy
//! session is immediate. Each further attempt multiplies the delay by the
//! factor (seeded at the minimum) up to the ceiling. Only a heartbeat on
//! a fresh subscription resets it.

use std::time::Duration;

use flotilla_core::config::SchedulingConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            current: Duration::ZERO,
            min,
            max,
            factor,
        }
    }

    pub fn from_config(config: &SchedulingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_min_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.backoff_factor,
        )
    }

    /// The delay to wait now; escalates for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.escalate(delay);
        delay
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    fn escalate(&self, from: Duration) -> Duration {
        if from.is_zero() {
            return self.min.min(self.max);
        }
        let next_ms = (from.as_millis() as f64 * self.factor).round();
        let max_ms = self.max.as_millis() as f64;
        Duration::from_millis(next_ms.min(max_ms) as u64)
    }
}
