//! Completion-time ("watermark") contract and the in-process reference service.
//!
//! Each stream that can produce watermark signals owns one write-handle. The
//! read-handle is shared by every dependency gate in the process and reports the
//! highest time below which all watermark-writing operations are finished.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Initiated time submitted once a writing stream has nothing left to contribute.
pub const COMPLETION_TIME_SENTINEL_NS: u64 = u64::MAX;

/// Single-writer handle owned by one stream.
pub trait LocalCompletionTimeWriter: Send + Sync {
    /// Records that an operation scheduled at `time_ns` has been handed to execution.
    fn submit_initiated(&self, time_ns: u64) -> Result<(), CompletionTimeError>;

    /// Records that the operation initiated at `time_ns` has finished.
    fn submit_completed(&self, time_ns: u64) -> Result<(), CompletionTimeError>;

    /// Moves the local safe time up to `time_ns` without a pending operation.
    ///
    /// Only valid when nothing below `time_ns` is still running on this stream.
    fn advance_to(&self, time_ns: u64) -> Result<(), CompletionTimeError> {
        self.submit_initiated(time_ns)?;
        self.submit_completed(time_ns)
    }
}

/// Process-wide view of the derived safe time. Never blocks.
pub trait GlobalCompletionTimeReader: Send + Sync {
    fn current_safe_time_ns(&self) -> u64;
}

/// Stand-in write-handle for operations that do not produce watermark signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompletionTimeWriter;

impl LocalCompletionTimeWriter for NoopCompletionTimeWriter {
    fn submit_initiated(&self, _time_ns: u64) -> Result<(), CompletionTimeError> {
        Ok(())
    }

    fn submit_completed(&self, _time_ns: u64) -> Result<(), CompletionTimeError> {
        Ok(())
    }
}

/// Errors raised by write-handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionTimeError {
    #[error("writer {writer}: initiated time {submitted_ns} precedes last initiated time {last_ns}")]
    InitiatedRegression {
        writer: usize,
        submitted_ns: u64,
        last_ns: u64,
    },
    #[error("writer {writer}: completed time {submitted_ns} has no matching initiated time")]
    UnknownCompletion { writer: usize, submitted_ns: u64 },
}

#[derive(Debug, Default)]
struct WriterState {
    last_initiated_ns: Option<u64>,
    // initiated time -> operations still running at that time
    pending: BTreeMap<u64, usize>,
}

impl WriterState {
    fn local_safe_ns(&self) -> u64 {
        match self.pending.keys().next() {
            Some(earliest) => *earliest,
            None => self.last_initiated_ns.unwrap_or(0),
        }
    }
}

/// Reference write-handle: tracks initiated-but-unfinished times for one stream.
///
/// Its local safe time is the earliest pending initiated time, or the last
/// initiated time when nothing is pending. Because initiated times never decrease,
/// the local safe time never decreases either.
#[derive(Debug)]
pub struct CompletionTimeWriter {
    id: usize,
    state: Mutex<WriterState>,
    published: Arc<AtomicU64>,
}

impl CompletionTimeWriter {
    fn new(id: usize, published: Arc<AtomicU64>) -> Self {
        Self {
            id,
            state: Mutex::new(WriterState::default()),
            published,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn last_initiated_ns(&self) -> Option<u64> {
        self.lock().last_initiated_ns
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.values().sum()
    }

    pub fn local_safe_time_ns(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &WriterState) {
        self.published.store(state.local_safe_ns(), Ordering::Release);
    }
}

impl LocalCompletionTimeWriter for CompletionTimeWriter {
    fn submit_initiated(&self, time_ns: u64) -> Result<(), CompletionTimeError> {
        let mut state = self.lock();
        if let Some(last_ns) = state.last_initiated_ns {
            if time_ns < last_ns {
                return Err(CompletionTimeError::InitiatedRegression {
                    writer: self.id,
                    submitted_ns: time_ns,
                    last_ns,
                });
            }
        }
        state.last_initiated_ns = Some(time_ns);
        *state.pending.entry(time_ns).or_insert(0) += 1;
        self.publish(&state);
        Ok(())
    }

    fn submit_completed(&self, time_ns: u64) -> Result<(), CompletionTimeError> {
        let mut state = self.lock();
        let Some(count) = state.pending.get_mut(&time_ns) else {
            return Err(CompletionTimeError::UnknownCompletion {
                writer: self.id,
                submitted_ns: time_ns,
            });
        };
        *count -= 1;
        if *count == 0 {
            state.pending.remove(&time_ns);
        }
        self.publish(&state);
        Ok(())
    }
}

/// Reference read-handle: minimum of every writer's local safe time.
#[derive(Debug)]
pub struct CompletionTimeReader {
    locals: Vec<Arc<AtomicU64>>,
    safe_ns: AtomicU64,
}

impl GlobalCompletionTimeReader for CompletionTimeReader {
    fn current_safe_time_ns(&self) -> u64 {
        let candidate = self
            .locals
            .iter()
            .map(|local| local.load(Ordering::Acquire))
            .min()
            .unwrap_or(COMPLETION_TIME_SENTINEL_NS);
        let previous = self.safe_ns.fetch_max(candidate, Ordering::AcqRel);
        previous.max(candidate)
    }
}

/// Owns the write-handles of one run and the shared read-handle over them.
#[derive(Debug, Clone)]
pub struct CompletionTimeService {
    writers: Vec<Arc<CompletionTimeWriter>>,
    reader: Arc<CompletionTimeReader>,
}

impl CompletionTimeService {
    /// Creates `writer_count` write-handles; with zero writers the safe time is unbounded.
    pub fn new(writer_count: usize) -> Self {
        let locals: Vec<_> = (0..writer_count)
            .map(|_| Arc::new(AtomicU64::new(0)))
            .collect();
        let writers = locals
            .iter()
            .enumerate()
            .map(|(id, local)| Arc::new(CompletionTimeWriter::new(id, local.clone())))
            .collect();
        Self {
            writers,
            reader: Arc::new(CompletionTimeReader {
                locals,
                safe_ns: AtomicU64::new(0),
            }),
        }
    }

    pub fn writer(&self, id: usize) -> Option<Arc<CompletionTimeWriter>> {
        self.writers.get(id).cloned()
    }

    pub fn writers(&self) -> &[Arc<CompletionTimeWriter>] {
        &self.writers
    }

    pub fn reader(&self) -> Arc<CompletionTimeReader> {
        self.reader.clone()
    }
}
