//! Process-wide monotonic clock
//!
//! All pipeline timestamps (first_seen, deadlines, staleness factors) are
//! nanoseconds on a single monotonic timeline so they can be compared and
//! subtracted without worrying about wall-clock jumps.

use std::sync::OnceLock;
use std::time::Duration;

use quanta::Clock;

/// Monotonic timestamp in nanoseconds since an arbitrary process-local epoch.
pub type MonoTime = u64;

fn clock() -> &'static Clock {
    static CLOCK: OnceLock<Clock> = OnceLock::new();
    CLOCK.get_or_init(Clock::new)
}

/// Current monotonic time in nanoseconds.
#[inline]
pub fn now() -> MonoTime {
    clock().delta_as_nanos(0, clock().raw())
}

/// Nanoseconds elapsed since `earlier`, zero if `earlier` is in the future.
#[inline]
pub fn elapsed_ns(earlier: MonoTime) -> u64 {
    now().saturating_sub(earlier)
}

/// Convenience: elapsed milliseconds since `earlier` as f64.
#[inline]
pub fn elapsed_ms(earlier: MonoTime) -> f64 {
    elapsed_ns(earlier) as f64 / 1_000_000.0
}

/// Add a duration to a monotonic timestamp.
#[inline]
pub fn add(ts: MonoTime, d: Duration) -> MonoTime {
    ts.saturating_add(d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn add_saturates() {
        assert_eq!(add(u64::MAX - 1, Duration::from_secs(5)), u64::MAX);
    }
}
