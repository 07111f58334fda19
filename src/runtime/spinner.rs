use crate::operation::Operation;
use crate::temporal::{duration_ns, TimeSource};
use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default lead applied by the "slightly early" spinner used by stream workers.
pub const DEFAULT_EARLY_OFFSET: Duration = Duration::from_millis(1);

/// Result of an abortable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinOutcome {
    Reached,
    Aborted,
}

/// Busy-waits the calling thread until an absolute time.
///
/// Scheduler sleeps are too coarse for sub-millisecond start times, so the wait
/// polls the clock instead of parking. A non-zero offset makes the spinner
/// return that much before the target, leaving room for the context switch into
/// the handler, which then spins to the exact time itself.
#[derive(Clone)]
pub struct Spinner {
    time_source: Arc<dyn TimeSource>,
    offset_ns: u64,
}

impl Spinner {
    /// Spinner that returns no earlier than the requested time.
    pub fn exact(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            time_source,
            offset_ns: 0,
        }
    }

    pub fn slightly_early(time_source: Arc<dyn TimeSource>, offset: Duration) -> Self {
        Self {
            time_source,
            offset_ns: duration_ns(offset),
        }
    }

    pub fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_ns)
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time_source
    }

    /// Returns once `target_ns - offset` is reached; immediately if already past.
    pub fn wait_until(&self, target_ns: u64) {
        let target_ns = target_ns.saturating_sub(self.offset_ns);
        while self.time_source.now_ns() < target_ns {
            hint::spin_loop();
        }
    }

    /// Like [`Spinner::wait_until`], but checks `abort` on every iteration.
    pub fn wait_until_or_abort(&self, target_ns: u64, abort: &AtomicBool) -> SpinOutcome {
        let target_ns = target_ns.saturating_sub(self.offset_ns);
        loop {
            if self.time_source.now_ns() >= target_ns {
                return SpinOutcome::Reached;
            }
            if abort.load(Ordering::Relaxed) {
                return SpinOutcome::Aborted;
            }
            hint::spin_loop();
        }
    }

    pub fn wait_for_scheduled_start(&self, operation: &Operation) {
        self.wait_until(operation.scheduled_start_time_ns);
    }

    /// Yields the thread for a short, bounded interval in low-CPU polling loops.
    pub fn power_nap(interval: Duration) {
        if interval.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(interval);
        }
    }
}

impl fmt::Debug for Spinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinner")
            .field("offset_ns", &self.offset_ns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::ManualTimeSource;

    #[test]
    fn past_target_returns_immediately() {
        let clock = Arc::new(ManualTimeSource::new(1_000));
        let spinner = Spinner::exact(clock.clone());
        spinner.wait_until(10);
        spinner.wait_until(1_000);
        assert_eq!(clock.now_ns(), 1_000);
    }

    #[test]
    fn early_spinner_returns_before_target() {
        let clock = Arc::new(ManualTimeSource::new(900));
        let spinner = Spinner::slightly_early(clock, Duration::from_nanos(100));
        // 1_000 - 100 has already been reached, so this must not spin.
        spinner.wait_until(1_000);
        assert_eq!(spinner.offset(), Duration::from_nanos(100));
    }

    #[test]
    fn abort_flag_interrupts_wait() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let spinner = Spinner::exact(clock);
        let abort = AtomicBool::new(true);
        assert_eq!(
            spinner.wait_until_or_abort(u64::MAX, &abort),
            SpinOutcome::Aborted
        );
    }

    #[test]
    fn reached_wins_over_abort_when_target_passed() {
        let clock = Arc::new(ManualTimeSource::new(50));
        let spinner = Spinner::exact(clock);
        let abort = AtomicBool::new(true);
        assert_eq!(spinner.wait_until_or_abort(50, &abort), SpinOutcome::Reached);
    }
}
