use crate::temporal::TimeSource;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failure message captured from a worker, handler or gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub at_ns: u64,
    pub source: String,
    pub message: String,
}

/// Thread-safe, unbounded sink for failure text.
///
/// Reporting never panics: a poisoned lock is recovered rather than propagated,
/// so a panicking runner cannot silence every other worker.
#[derive(Clone)]
pub struct ErrorReporter {
    entries: Arc<Mutex<Vec<ErrorRecord>>>,
    encountered: Arc<AtomicBool>,
    time_source: Arc<dyn TimeSource>,
}

impl ErrorReporter {
    pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            encountered: Arc::new(AtomicBool::new(false)),
            time_source,
        }
    }

    pub fn report(&self, source: &str, message: impl Into<String>) {
        let record = ErrorRecord {
            at_ns: self.time_source.now_ns(),
            source: source.to_string(),
            message: message.into(),
        };
        self.lock().push(record);
        self.encountered.store(true, Ordering::Release);
    }

    pub fn error_encountered(&self) -> bool {
        self.encountered.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.lock().clone()
    }

    /// Removes and returns every record collected so far.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Human-readable end-of-run report.
    pub fn render(&self) -> String {
        let entries = self.lock();
        let mut out = String::new();
        let _ = writeln!(out, "{} error(s) reported", entries.len());
        for record in entries.iter() {
            let _ = writeln!(
                out,
                "[{}ns] {}: {}",
                record.at_ns, record.source, record.message
            );
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("entries", &self.len())
            .field("encountered", &self.error_encountered())
            .finish()
    }
}
