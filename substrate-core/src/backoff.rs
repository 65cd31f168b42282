//! The exponential backoff schedule shared by the Outbox and Inbox `fail`
//! operations.

use chrono::Duration;

/// Maximum delay ever returned, in seconds.
pub const MAX_BACKOFF_SECONDS: i64 = 600;

/// Attempt counts beyond this are treated as this value for the purpose of
/// the `10 * 2^n` formula, so the delay plateaus instead of overflowing.
pub const MAX_ATTEMPTS_CONSIDERED: u32 = 10;

/// Returns the delay to apply after the `attempt_count`-th failure.
///
/// | attempt | delay (s) |
/// |---|---|
/// | 1 | 10 |
/// | 2 | 20 |
/// | 3 | 40 |
/// | 4 | 80 |
/// | 5 | 160 |
/// | 6+ | `min(600, 10 * 2^min(10, attempt_count))` |
pub fn backoff(attempt_count: i32) -> Duration {
    let attempt_count = attempt_count.max(1) as u32;

    let seconds = match attempt_count {
        1 => 10,
        2 => 20,
        3 => 40,
        4 => 80,
        5 => 160,
        _ => {
            let exponent = attempt_count.min(MAX_ATTEMPTS_CONSIDERED);
            let delay = 10i64.saturating_mul(1i64 << exponent);
            delay.min(MAX_BACKOFF_SECONDS)
        }
    };

    Duration::seconds(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_documented_schedule() {
        assert_eq!(backoff(1), Duration::seconds(10));
        assert_eq!(backoff(2), Duration::seconds(20));
        assert_eq!(backoff(3), Duration::seconds(40));
        assert_eq!(backoff(4), Duration::seconds(80));
        assert_eq!(backoff(5), Duration::seconds(160));
    }

    #[test]
    fn caps_at_max_backoff_seconds() {
        assert_eq!(backoff(6), Duration::seconds(600));
        assert_eq!(backoff(7), Duration::seconds(600));
        assert_eq!(backoff(100), Duration::seconds(600));
    }

    #[test]
    fn treats_non_positive_attempts_as_the_first() {
        assert_eq!(backoff(0), backoff(1));
        assert_eq!(backoff(-3), backoff(1));
    }
}
