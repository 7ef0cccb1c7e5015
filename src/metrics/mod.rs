//! Windowed metric accumulators
//!
//! Every metric keeps two sets of values: cumulative ("all time") counters
//! that only ever grow, and current-window accumulators that the periodic
//! rollover swaps into public `period_*` fields. The rollover is the only
//! place state is reset; accumulate and rollover run under the same lock on
//! the owning metric so a sample lands in exactly one window.

pub mod network;
pub mod pid;
pub mod rtp;

use std::sync::OnceLock;
use std::time::Instant;

use crate::constants::TICKS_PER_SECOND;

/// Shared rollover bookkeeping, held by composition in each metric.
#[derive(Debug, Clone)]
pub struct WindowActivity {
    sampling_period_ms: u64,
    last_period_end_time: Option<String>,
    sample_count: u64,
}

impl WindowActivity {
    pub fn new(sampling_period_ms: u64) -> Self {
        Self {
            sampling_period_ms,
            last_period_end_time: None,
            sample_count: 0,
        }
    }

    pub fn sampling_period_ms(&self) -> u64 {
        self.sampling_period_ms
    }

    pub fn set_sampling_period_ms(&mut self, period_ms: u64) {
        self.sampling_period_ms = period_ms;
    }

    /// RFC-3339 end time of the last completed window, if any has completed
    pub fn last_period_end_time(&self) -> Option<&str> {
        self.last_period_end_time.as_deref()
    }

    /// Monotonically increasing count of completed windows
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Generic end-of-window bookkeeping. Concrete metrics swap their own
    /// accumulators first and call this last, so the stamp and counter
    /// advance even when a metric has nothing to publish.
    pub fn finish_rollover(&mut self) {
        self.last_period_end_time = Some(chrono::Utc::now().to_rfc3339());
        self.sample_count += 1;
    }
}

/// Rollover contract shared by all metric kinds.
pub trait Windowed {
    /// Publish the current window into the `period_*` fields, zero the
    /// accumulators and stamp the window end.
    fn rollover(&mut self);
}

/// Nanoseconds elapsed on the process-wide monotonic clock.
///
/// All metric timestamps are expressed in these ticks so tests can inject
/// synthetic time instead.
pub fn monotonic_ticks() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    let nanos = epoch.elapsed().as_nanos();
    nanos.min(i64::MAX as u128) as i64
}

/// Ticks-per-second helper for durations expressed in seconds.
pub fn seconds_to_ticks(secs: i64) -> i64 {
    secs * TICKS_PER_SECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_rollover_stamps_and_counts() {
        let mut window = WindowActivity::new(5000);
        assert_eq!(window.sample_count(), 0);
        assert!(window.last_period_end_time().is_none());

        window.finish_rollover();
        assert_eq!(window.sample_count(), 1);
        assert!(window.last_period_end_time().is_some());

        window.finish_rollover();
        assert_eq!(window.sample_count(), 2);
    }

    #[test]
    fn monotonic_ticks_advances() {
        let a = monotonic_ticks();
        let b = monotonic_ticks();
        assert!(b >= a);
    }
}
