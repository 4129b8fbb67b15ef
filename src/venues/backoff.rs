//! Reconnect backoff shared by every venue client.

use std::time::Duration;

/// Consecutive failures tolerated before a client goes terminal.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Backoff cap.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Capped exponential backoff: `min(2^attempts * 1s, 30s)`, terminal after
/// `MAX_RECONNECT_ATTEMPTS` consecutive failures. A successful connection
/// resets the counter.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. `Some(delay)` to wait before the next attempt,
    /// `None` once the retry budget is exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= MAX_RECONNECT_ATTEMPTS {
            return None;
        }
        let exp = Duration::from_secs(1u64 << self.attempts.min(30));
        Some(exp.min(MAX_DELAY))
    }

    /// Call on successful connection so failures must be consecutive.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_go_terminal() {
        let mut backoff = ReconnectBackoff::new();
        assert_eq!(backoff.on_failure(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.on_failure(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.on_failure(), Some(Duration::from_secs(8)));
        assert_eq!(backoff.on_failure(), Some(Duration::from_secs(16)));
        // Fifth consecutive failure exhausts the budget
        assert_eq!(backoff.on_failure(), None);
    }

    #[test]
    fn test_reset_makes_failures_consecutive_only() {
        let mut backoff = ReconnectBackoff::new();
        backoff.on_failure();
        backoff.on_failure();
        backoff.reset();
        assert_eq!(backoff.on_failure(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_delay_is_capped() {
        // The cap only matters if the attempt budget is ever raised, but the
        // arithmetic should honor it regardless
        let mut backoff = ReconnectBackoff { attempts: 0 };
        for _ in 0..4 {
            backoff.on_failure();
        }
        assert!(backoff
            .on_failure()
            .map_or(true, |d| d <= Duration::from_secs(30)));
    }
}
