use crate::classification::{DependencyClassifier, OperationClassification};
use crate::completion_time::{
    GlobalCompletionTimeReader, LocalCompletionTimeWriter, NoopCompletionTimeWriter,
};
use crate::error_reporter::ErrorReporter;
use crate::logging::{JsonLineLogger, LogRotationPolicy, SharedLogger};
use crate::operation::{Operation, OperationStream};
use crate::runtime::dispatcher::OperationDispatcher;
use crate::runtime::gate::DependencyGate;
use crate::runtime::handler::{HandlerInitError, OperationHandler, OperationHandlerFactory};
use crate::runtime::spinner::{Spinner, DEFAULT_EARLY_OFFSET};
use crate::temporal::{duration_ns, TimeSource};
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const WORKER_MODULE: &str = "cadence::runtime::worker";

/// Poll cadence and grace periods shared by every stream of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Lead applied when waiting for a scheduled start before dispatch.
    pub early_offset: Duration,
    pub drain_poll_interval: Duration,
    /// Grace period for already-dispatched handlers once a stream stops.
    pub shutdown_timeout: Duration,
    pub dependency_poll_interval: Duration,
    pub dependency_timeout: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            early_offset: DEFAULT_EARLY_OFFSET,
            drain_poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
            dependency_poll_interval: Duration::from_micros(100),
            dependency_timeout: Duration::from_secs(60),
        }
    }
}

/// Lifecycle of a stream worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Finished,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            3 => WorkerState::Finished,
            _ => WorkerState::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Finished => "finished",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State cell, per-stream counters and the finished signal the owning driver
/// waits on.
#[derive(Debug, Default)]
pub struct WorkerLifecycle {
    state: AtomicU8,
    dispatched: AtomicU64,
    skipped: AtomicU64,
    finished: Mutex<bool>,
    cv: Condvar,
}

impl WorkerLifecycle {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Operations accepted by the dispatcher.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Operations dropped after a per-operation error.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transition(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.transition(WorkerState::Finished);
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        *finished = true;
        self.cv.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the worker finished or `timeout` elapsed.
    pub fn await_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        while !*finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cv
                .wait_timeout(finished, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            finished = next;
        }
        true
    }
}

/// One-ahead buffer over an operation source.
///
/// Each `pull` makes at most one retrieval attempt so callers can observe forced
/// terminate between attempts; retrieval errors are reported under `source`.
pub(crate) struct SourceCursor {
    stream: OperationStream,
    buffered: Option<Operation>,
    exhausted: bool,
}

impl SourceCursor {
    pub(crate) fn new(stream: OperationStream) -> Self {
        Self {
            stream,
            buffered: None,
            exhausted: false,
        }
    }

    pub(crate) fn pull(&mut self, errors: &ErrorReporter, source: &str) {
        if self.buffered.is_some() || self.exhausted {
            return;
        }
        match self.stream.next() {
            Some(Ok(operation)) => self.buffered = Some(operation),
            Some(Err(err)) => errors.report(source, err.to_string()),
            None => self.exhausted = true,
        }
    }

    /// Either an operation is buffered or the source is known to be exhausted.
    pub(crate) fn is_settled(&self) -> bool {
        self.buffered.is_some() || self.exhausted
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.exhausted && self.buffered.is_none()
    }

    pub(crate) fn peek_time_ns(&self) -> Option<u64> {
        self.buffered
            .as_ref()
            .map(|operation| operation.scheduled_start_time_ns)
    }

    pub(crate) fn take(&mut self) -> Option<Operation> {
        self.buffered.take()
    }
}

pub(crate) fn noop_writer() -> Arc<dyn LocalCompletionTimeWriter> {
    Arc::new(NoopCompletionTimeWriter)
}

/// Collaborators shared by every stream worker of a run.
#[derive(Clone)]
pub struct StreamContext {
    time_source: Arc<dyn TimeSource>,
    errors: ErrorReporter,
    logger: SharedLogger,
    classifier: Arc<DependencyClassifier>,
    factory: Arc<dyn OperationHandlerFactory>,
    reader: Arc<dyn GlobalCompletionTimeReader>,
    forced_terminate: Arc<AtomicBool>,
    timing: StreamTiming,
}

impl StreamContext {
    pub fn new(
        time_source: Arc<dyn TimeSource>,
        errors: ErrorReporter,
        classifier: Arc<DependencyClassifier>,
        factory: Arc<dyn OperationHandlerFactory>,
        reader: Arc<dyn GlobalCompletionTimeReader>,
    ) -> Self {
        let logger = SharedLogger::new(
            JsonLineLogger::new(LogRotationPolicy::default()),
            time_source.clone(),
        );
        Self {
            time_source,
            errors,
            logger,
            classifier,
            factory,
            reader,
            forced_terminate: Arc::new(AtomicBool::new(false)),
            timing: StreamTiming::default(),
        }
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Shares an externally owned forced-terminate flag.
    pub fn with_forced_terminate(mut self, flag: Arc<AtomicBool>) -> Self {
        self.forced_terminate = flag;
        self
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time_source
    }

    pub fn errors(&self) -> &ErrorReporter {
        &self.errors
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    pub fn classifier(&self) -> &DependencyClassifier {
        &self.classifier
    }

    pub fn timing(&self) -> StreamTiming {
        self.timing
    }

    pub fn forced_terminate_flag(&self) -> Arc<AtomicBool> {
        self.forced_terminate.clone()
    }

    pub fn forced_terminate(&self) {
        self.forced_terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_forced_terminate(&self) -> bool {
        self.forced_terminate.load(Ordering::SeqCst)
    }

    pub(crate) fn early_spinner(&self) -> Spinner {
        Spinner::slightly_early(self.time_source.clone(), self.timing.early_offset)
    }

    /// Builds a handler with the given write-handle and, for reading-dependent
    /// operations, a dependency gate.
    pub(crate) fn init_handler(
        &self,
        operation: Operation,
        classification: OperationClassification,
        writer: Arc<dyn LocalCompletionTimeWriter>,
    ) -> Result<OperationHandler, HandlerInitError> {
        let runner = self.factory.runner_for(&operation)?;
        let mut handler = OperationHandler::new(
            operation,
            runner,
            writer,
            Spinner::exact(self.time_source.clone()),
        );
        if classification.dependency_mode.reads_watermark() {
            handler.add_before_execute_check(Box::new(DependencyGate::new(
                self.reader.clone(),
                self.time_source.clone(),
                self.errors.clone(),
                self.forced_terminate.clone(),
                self.timing.dependency_poll_interval,
                self.timing.dependency_timeout,
            )));
        }
        Ok(handler)
    }

    /// Polls the dispatcher until nothing is outstanding, forced terminate is
    /// raised, or the shutdown grace period elapses. Returns `false` on timeout.
    pub(crate) fn drain(&self, dispatcher: &OperationDispatcher) -> bool {
        let deadline_ns = self
            .time_source
            .now_ns()
            .saturating_add(duration_ns(self.timing.shutdown_timeout));
        loop {
            if dispatcher.outstanding() == 0 || self.is_forced_terminate() {
                return true;
            }
            if self.time_source.now_ns() >= deadline_ns {
                return dispatcher.outstanding() == 0;
            }
            Spinner::power_nap(self.timing.drain_poll_interval);
        }
    }

    /// Runs the DRAINING phase of stream `name`; a timeout is reported with the
    /// number of handlers still outstanding and the worker finishes regardless.
    pub(crate) fn drain_stream(
        &self,
        name: &str,
        lifecycle: &WorkerLifecycle,
        dispatcher: &OperationDispatcher,
    ) {
        lifecycle.transition(WorkerState::Draining);
        self.logger.info(
            WORKER_MODULE,
            name,
            &format!("draining with {} outstanding", dispatcher.outstanding()),
        );
        if !self.drain(dispatcher) {
            let message = format!(
                "drain timed out after {:?} with {} handlers outstanding",
                self.timing.shutdown_timeout,
                dispatcher.outstanding()
            );
            self.logger.error(WORKER_MODULE, name, &message);
            self.errors.report(name, message);
        }
        self.logger.info(WORKER_MODULE, name, "finished");
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("timing", &self.timing)
            .field("forced_terminate", &self.is_forced_terminate())
            .finish()
    }
}

/// Loop body run on a dedicated OS thread.
pub trait StreamWorker: Send + 'static {
    fn name(&self) -> &str;

    fn forced_terminate_flag(&self) -> Arc<AtomicBool>;

    /// Runs RUNNING → DRAINING; the caller marks the worker FINISHED afterwards.
    fn run(self, lifecycle: &WorkerLifecycle);
}

/// Driver-facing surface of a started worker.
pub struct WorkerHandle {
    name: String,
    lifecycle: Arc<WorkerLifecycle>,
    forced_terminate: Arc<AtomicBool>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    /// Raises the shared forced-terminate flag; observed at the next checkpoint.
    pub fn forced_terminate(&self) {
        self.forced_terminate.store(true, Ordering::SeqCst);
    }

    pub fn await_finished(&self, timeout: Duration) -> bool {
        self.lifecycle.await_finished(timeout)
    }

    pub fn dispatched(&self) -> u64 {
        self.lifecycle.dispatched()
    }

    pub fn skipped(&self) -> u64 {
        self.lifecycle.skipped()
    }

    /// Joins the worker thread once it has finished.
    pub fn join(&self) {
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Spawns `worker` on a named thread and returns its handle.
pub fn spawn<W: StreamWorker>(worker: W) -> io::Result<WorkerHandle> {
    let name = worker.name().to_string();
    let forced_terminate = worker.forced_terminate_flag();
    let lifecycle = Arc::new(WorkerLifecycle::default());
    let thread_lifecycle = lifecycle.clone();
    let join = thread::Builder::new().name(name.clone()).spawn(move || {
        worker.run(&thread_lifecycle);
        thread_lifecycle.finish();
    })?;
    Ok(WorkerHandle {
        name,
        lifecycle,
        forced_terminate,
        join: Mutex::new(Some(join)),
    })
}
