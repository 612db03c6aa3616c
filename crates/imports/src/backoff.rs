//! Poll interval schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stepped geometric backoff for status polling.
///
/// The interval for attempt `n` (1-indexed) is
/// `min(initial * growth^floor(n / step), max)`, so it stays flat for a few
/// attempts and then grows in small jumps until it hits the cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub max: Duration,
    pub growth: f64,
    pub step: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(10),
            growth: 1.2,
            step: 5,
        }
    }
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Wait before attempt `attempt` (1-indexed).
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let step = self.step.max(1);
        let exponent = (attempt / step).min(i32::MAX as u32) as i32;

        let initial_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let delay_ms = (initial_ms * self.growth.powi(exponent)).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }

    /// Wall-clock spent waiting across `max_attempts` attempts.
    pub fn total_budget(&self, max_attempts: u32) -> Duration {
        (1..=max_attempts).map(|n| self.interval_for(n)).sum()
    }
}
