use crate::completion_time::GlobalCompletionTimeReader;
use crate::error_reporter::ErrorReporter;
use crate::operation::Operation;
use crate::runtime::handler::BeforeExecuteCheck;
use crate::runtime::spinner::Spinner;
use crate::temporal::{duration_ns, TimeSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GATE_SOURCE: &str = "dependency_gate";

/// Holds a reading-dependent operation until the shared safe time reaches its
/// dependency time stamp.
///
/// The watermark's update cadence is not observable, so the gate polls with a
/// short power nap. It gives up (and reports) when forced terminate is raised or
/// the timeout elapses, so a stalled watermark never hangs the process.
pub struct DependencyGate {
    reader: Arc<dyn GlobalCompletionTimeReader>,
    time_source: Arc<dyn TimeSource>,
    errors: ErrorReporter,
    forced_terminate: Arc<AtomicBool>,
    poll_interval: Duration,
    timeout: Duration,
}

impl DependencyGate {
    pub fn new(
        reader: Arc<dyn GlobalCompletionTimeReader>,
        time_source: Arc<dyn TimeSource>,
        errors: ErrorReporter,
        forced_terminate: Arc<AtomicBool>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            reader,
            time_source,
            errors,
            forced_terminate,
            poll_interval,
            timeout,
        }
    }
}

impl BeforeExecuteCheck for DependencyGate {
    fn check(&mut self, operation: &Operation) -> bool {
        let required_ns = operation.dependency_time_stamp_ns;
        let deadline_ns = self
            .time_source
            .now_ns()
            .saturating_add(duration_ns(self.timeout));
        loop {
            let safe_ns = self.reader.current_safe_time_ns();
            if safe_ns >= required_ns {
                return true;
            }
            if self.forced_terminate.load(Ordering::Relaxed) {
                self.errors.report(
                    GATE_SOURCE,
                    format!(
                        "forced terminate while {operation} waited for completion time {required_ns}ns (safe time {safe_ns}ns)"
                    ),
                );
                return false;
            }
            if self.time_source.now_ns() >= deadline_ns {
                self.errors.report(
                    GATE_SOURCE,
                    format!(
                        "{operation} timed out after {:?} waiting for completion time {required_ns}ns (safe time {safe_ns}ns)",
                        self.timeout
                    ),
                );
                return false;
            }
            Spinner::power_nap(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::{ManualTimeSource, SystemTimeSource};
    use std::sync::atomic::AtomicU64;

    struct FixedReader(AtomicU64);

    impl GlobalCompletionTimeReader for FixedReader {
        fn current_safe_time_ns(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn gate(
        safe_ns: u64,
        time_source: Arc<dyn TimeSource>,
        forced: bool,
        timeout: Duration,
    ) -> (DependencyGate, ErrorReporter) {
        let errors = ErrorReporter::new(time_source.clone());
        let gate = DependencyGate::new(
            Arc::new(FixedReader(AtomicU64::new(safe_ns))),
            time_source,
            errors.clone(),
            Arc::new(AtomicBool::new(forced)),
            Duration::from_micros(50),
            timeout,
        );
        (gate, errors)
    }

    #[test]
    fn passes_once_safe_time_reaches_dependency() {
        let (mut gate, errors) = gate(
            150,
            Arc::new(ManualTimeSource::new(0)),
            false,
            Duration::from_secs(1),
        );
        let operation = Operation::new("read", 200).with_dependency_time_stamp(150);
        assert!(gate.check(&operation));
        assert!(errors.is_empty());
    }

    #[test]
    fn forced_terminate_fails_the_gate() {
        let (mut gate, errors) = gate(
            0,
            Arc::new(ManualTimeSource::new(0)),
            true,
            Duration::from_secs(60),
        );
        let operation = Operation::new("read", 200).with_dependency_time_stamp(150);
        assert!(!gate.check(&operation));
        assert_eq!(errors.len(), 1);
        assert!(errors.snapshot()[0].message.contains("forced terminate"));
    }

    #[test]
    fn stalled_watermark_times_out() {
        let (mut gate, errors) = gate(
            0,
            Arc::new(SystemTimeSource::new()),
            false,
            Duration::from_millis(5),
        );
        let operation = Operation::new("read", 200).with_dependency_time_stamp(150);
        assert!(!gate.check(&operation));
        assert!(errors.snapshot()[0].message.contains("timed out"));
    }
}
