use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Time source consulted by every wait in the driver.
///
/// All operation times share this base: a scheduled start time of `t` means
/// "when `now_ns()` reports `t`".
pub trait TimeSource: Send + Sync {
    /// Returns the current time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Returns the current time in milliseconds.
    fn now_ms(&self) -> u64 {
        ns_to_ms(self.now_ns())
    }
}

/// Monotonic clock anchored at construction, backed by `Instant`.
#[derive(Debug, Clone)]
pub struct SystemTimeSource {
    start: Instant,
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ns(&self) -> u64 {
        saturating_u64(self.start.elapsed().as_nanos())
    }
}

/// Hand-driven clock used to make waits deterministic in tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ns: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Jumps the clock to `now_ns`. Moving backwards is ignored.
    pub fn set(&self, now_ns: u64) {
        self.now_ns.fetch_max(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by_ns = duration_ns(by);
        let _ = self
            .now_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by_ns))
            });
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// Converts a duration to nanoseconds, saturating at `u64::MAX`.
pub fn duration_ns(duration: Duration) -> u64 {
    saturating_u64(duration.as_nanos())
}

pub fn ns_to_ms(ns: u64) -> u64 {
    ns / 1_000_000
}

fn saturating_u64(value: u128) -> u64 {
    if value > u64::MAX as u128 {
        u64::MAX
    } else {
        value as u64
    }
}
