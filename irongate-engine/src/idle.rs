/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Exponential backoff for retries against a full archiver channel.

use std::time::{Duration, Instant};

/// Smallest retry delay used by the framer.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_micros(100);

/// Largest retry delay used by the framer.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Doubling retry delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    retry_at: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

impl Backoff {
    /// Creates a backoff starting at `base` and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            retry_at: None,
        }
    }

    /// Returns true when a retry may be attempted.
    #[must_use]
    pub fn is_ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// # Returns
    /// The delay before the next attempt.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        self.retry_at = Some(now + delay);
        delay
    }

    /// Records a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.retry_at = None;
    }

    /// Returns the delay the next failure would schedule.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let now = Instant::now();
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));

        assert_eq!(backoff.on_failure(now), Duration::from_millis(1));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(2));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(4));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(5));
        assert_eq!(backoff.current(), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_gates_retries() {
        let now = Instant::now();
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        assert!(backoff.is_ready(now));

        backoff.on_failure(now);
        assert!(!backoff.is_ready(now + Duration::from_millis(5)));
        assert!(backoff.is_ready(now + Duration::from_millis(10)));

        backoff.reset();
        assert!(backoff.is_ready(now));
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }
}
