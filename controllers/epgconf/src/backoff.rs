//! # Exponential Backoff
//!
//! Requeue delays for failed reconciliations. The delay starts at 5ms and
//! doubles on every consecutive failure up to 1000s, the same per-item curve
//! client-go's rate-limited workqueue applies.

use std::time::Duration;

/// Default first delay
pub const DEFAULT_BASE: Duration = Duration::from_millis(5);
/// Default delay cap
pub const DEFAULT_MAX: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Each call to `next_backoff()` returns the current delay and doubles it
/// for the next call, capped at `max`. A key that succeeds drops its
/// calculator; the next failure starts a fresh one.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound
    max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }
}
