//! Timestamps used by signal histories.
//!
//! Histories are keyed by microseconds. Providers usually stamp their own
//! events; when they do not, the engine falls back to a monotonic clock
//! anchored the first time it is read.

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds per second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Integers above this are microsecond epoch timestamps rather than seconds.
pub const USEC_TIMESTAMP_THRESHOLD: i64 = 1_506_514_324_881_224;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the clock was first read.
///
/// Never returns zero so that a zero timestamp can keep meaning "not stamped".
#[must_use]
pub fn monotonic_micros() -> u64 {
    let origin = *ORIGIN.get_or_init(Instant::now);
    let elapsed = origin.elapsed().as_micros();
    u64::try_from(elapsed).unwrap_or(u64::MAX).max(1)
}

/// Converts a retention or window length in seconds to microseconds.
#[must_use]
pub const fn seconds_to_micros(seconds: u64) -> u64 {
    seconds.saturating_mul(MICROS_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_micros_non_decreasing() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(a >= 1);
        assert!(b >= a);
    }

    #[test]
    fn test_seconds_to_micros() {
        assert_eq!(seconds_to_micros(30), 30_000_000);
        assert_eq!(seconds_to_micros(u64::MAX), u64::MAX);
    }
}
