use crate::classification::DependencyClassifier;
use crate::completion_time::{
    CompletionTimeReader, CompletionTimeService, GlobalCompletionTimeReader,
    LocalCompletionTimeWriter,
};
use crate::config::DriverConfig;
use crate::error_reporter::{ErrorRecord, ErrorReporter};
use crate::logging::SharedLogger;
use crate::operation::OperationStream;
use crate::runtime::async_stream::AsyncStreamWorker;
use crate::runtime::blocking_stream::{BlockingStreamWorker, WriteEligibility};
use crate::runtime::dispatcher::OperationDispatcher;
use crate::runtime::handler::OperationHandlerFactory;
use crate::runtime::pool::{HandlerPool, PoolError};
use crate::runtime::worker::{noop_writer, StreamContext, StreamTiming, WorkerHandle, WorkerState};
use crate::temporal::TimeSource;
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const SERVICE_MODULE: &str = "cadence::runtime::service";
const POOL_NAME: &str = "cadence_pool";

/// Sources handed to one stream worker.
pub enum StreamAssignment {
    /// Two-way merge dispatched through the shared pool.
    Async {
        name: String,
        writes: OperationStream,
        reads: OperationStream,
    },
    /// Single merged source run one operation at a time on the worker thread.
    Blocking {
        name: String,
        operations: OperationStream,
        /// Whether any operation in the source is write-eligible; streams that
        /// never write hold the no-op handle and never hold back the safe time.
        writes_watermark: bool,
    },
}

impl StreamAssignment {
    pub fn name(&self) -> &str {
        match self {
            StreamAssignment::Async { name, .. } | StreamAssignment::Blocking { name, .. } => name,
        }
    }

    fn kind(&self) -> StreamKind {
        match self {
            StreamAssignment::Async { .. } => StreamKind::Async,
            StreamAssignment::Blocking { .. } => StreamKind::Blocking,
        }
    }

    fn owns_writer(&self) -> bool {
        match self {
            StreamAssignment::Async { .. } => true,
            StreamAssignment::Blocking {
                writes_watermark, ..
            } => *writes_watermark,
        }
    }
}

impl fmt::Debug for StreamAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAssignment")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Async,
    Blocking,
}

/// Collaborators and knobs for one run.
#[derive(Clone)]
pub struct ServiceSetup {
    pub time_source: Arc<dyn TimeSource>,
    pub errors: ErrorReporter,
    pub logger: SharedLogger,
    pub classifier: Arc<DependencyClassifier>,
    pub factory: Arc<dyn OperationHandlerFactory>,
    pub timing: StreamTiming,
    pub pool_threads: usize,
    pub pool_queue_capacity: usize,
    pub write_eligibility: WriteEligibility,
}

impl ServiceSetup {
    /// Builds a setup from the validated driver configuration.
    pub fn from_config(
        config: &DriverConfig,
        time_source: Arc<dyn TimeSource>,
        logger: SharedLogger,
        factory: Arc<dyn OperationHandlerFactory>,
    ) -> Self {
        Self {
            errors: ErrorReporter::new(time_source.clone()),
            time_source,
            logger,
            classifier: Arc::new(config.classifier()),
            factory,
            timing: config.timing(),
            pool_threads: config.async_pool_threads,
            pool_queue_capacity: config.async_pool_queue_capacity,
            write_eligibility: config.blocking_write_eligibility,
        }
    }
}

/// Errors raised while starting a run.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed to spawn stream `{stream}`: {source}")]
    Spawn {
        stream: String,
        #[source]
        source: io::Error,
    },
}

/// End-of-run state of one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub name: String,
    pub kind: StreamKind,
    pub state: WorkerState,
    pub finished: bool,
    pub dispatched: u64,
    pub skipped: u64,
}

/// Counters of the shared handler pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSummary {
    pub threads: usize,
    pub executed: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Everything the owning driver reports once a run is over.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub streams: Vec<StreamSummary>,
    pub safe_time_ns: u64,
    pub forced_terminate: bool,
    pub pool: PoolSummary,
    pub errors: Vec<ErrorRecord>,
}

impl RunSummary {
    /// Every stream finished and nothing was reported.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.streams.iter().all(|stream| stream.finished)
    }
}

struct RunningStream {
    kind: StreamKind,
    handle: WorkerHandle,
}

/// Owns the stream workers, the shared pool and the completion-time service of
/// one run.
pub struct StreamExecutorService {
    streams: Vec<RunningStream>,
    pool: Option<Arc<HandlerPool>>,
    completion_time: CompletionTimeService,
    forced_terminate: Arc<AtomicBool>,
    errors: ErrorReporter,
    logger: SharedLogger,
}

impl StreamExecutorService {
    /// Starts one OS thread per assignment.
    pub fn start(
        setup: ServiceSetup,
        assignments: Vec<StreamAssignment>,
    ) -> Result<Self, ServiceError> {
        let writer_count = assignments.iter().filter(|a| a.owns_writer()).count();
        let completion_time = CompletionTimeService::new(writer_count);
        let reader: Arc<dyn GlobalCompletionTimeReader> = completion_time.reader();
        let forced_terminate = Arc::new(AtomicBool::new(false));
        let pool = if assignments
            .iter()
            .any(|a| matches!(a, StreamAssignment::Async { .. }))
        {
            Some(Arc::new(HandlerPool::new(
                POOL_NAME,
                setup.pool_threads,
                setup.pool_queue_capacity,
                setup.errors.clone(),
            )?))
        } else {
            None
        };
        let ctx = StreamContext::new(
            setup.time_source.clone(),
            setup.errors.clone(),
            setup.classifier.clone(),
            setup.factory.clone(),
            reader,
        )
        .with_logger(setup.logger.clone())
        .with_timing(setup.timing)
        .with_forced_terminate(forced_terminate.clone());

        let mut service = Self {
            streams: Vec::with_capacity(assignments.len()),
            pool,
            completion_time,
            forced_terminate,
            errors: setup.errors.clone(),
            logger: setup.logger.clone(),
        };
        let mut next_writer = 0;
        for assignment in assignments {
            let kind = assignment.kind();
            let writer = if assignment.owns_writer() {
                let writer = service.completion_time.writer(next_writer);
                next_writer += 1;
                writer
                    .map(|writer| writer as Arc<dyn LocalCompletionTimeWriter>)
                    .unwrap_or_else(noop_writer)
            } else {
                noop_writer()
            };
            let name = assignment.name().to_string();
            let started = match assignment {
                StreamAssignment::Async {
                    name,
                    writes,
                    reads,
                } => {
                    let dispatcher = match &service.pool {
                        Some(pool) => OperationDispatcher::pooled(pool.clone()),
                        None => OperationDispatcher::inline(),
                    };
                    AsyncStreamWorker::new(name, ctx.clone(), writes, reads, writer, dispatcher)
                        .start()
                }
                StreamAssignment::Blocking {
                    name, operations, ..
                } => BlockingStreamWorker::new(
                    name,
                    ctx.clone(),
                    operations,
                    writer,
                    OperationDispatcher::inline(),
                )
                .with_write_eligibility(setup.write_eligibility)
                .start(),
            };
            match started {
                Ok(handle) => {
                    service
                        .logger
                        .info(SERVICE_MODULE, &name, "stream started");
                    service.streams.push(RunningStream { kind, handle });
                }
                Err(source) => {
                    service.forced_terminate();
                    service.join_finished(Duration::from_secs(1));
                    return Err(ServiceError::Spawn {
                        stream: name,
                        source,
                    });
                }
            }
        }
        Ok(service)
    }

    /// Raises the shared cancellation flag; workers observe it at their next
    /// checkpoint.
    pub fn forced_terminate(&self) {
        self.forced_terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_forced_terminate(&self) -> bool {
        self.forced_terminate.load(Ordering::SeqCst)
    }

    /// Waits for every stream to finish within one shared deadline.
    pub fn await_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.streams.iter().all(|stream| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            stream.handle.await_finished(remaining)
        })
    }

    pub fn reader(&self) -> Arc<CompletionTimeReader> {
        self.completion_time.reader()
    }

    pub fn errors(&self) -> &ErrorReporter {
        &self.errors
    }

    pub fn stream_names(&self) -> Vec<&str> {
        self.streams.iter().map(|stream| stream.handle.name()).collect()
    }

    fn join_finished(&self, timeout: Duration) {
        for stream in &self.streams {
            if stream.handle.await_finished(timeout) {
                stream.handle.join();
            }
        }
    }

    /// Waits up to `timeout` for the run, forces termination if it is still
    /// going, shuts the pool down and drains the error log into a summary.
    pub fn shutdown(self, timeout: Duration) -> RunSummary {
        if !self.await_finished(timeout) {
            self.logger.warn(
                SERVICE_MODULE,
                "service",
                "streams still running at shutdown; forcing termination",
            );
            self.forced_terminate();
            if !self.await_finished(timeout) {
                self.errors
                    .report("service", "streams did not finish after forced terminate");
            }
        }
        self.join_finished(Duration::ZERO);
        let pool = match &self.pool {
            Some(pool) => {
                pool.shutdown();
                let metrics = pool.metrics();
                PoolSummary {
                    threads: pool.threads(),
                    executed: metrics.executed(),
                    failed: metrics.failed(),
                    rejected: metrics.rejected(),
                }
            }
            None => PoolSummary::default(),
        };
        let streams = self
            .streams
            .iter()
            .map(|stream| StreamSummary {
                name: stream.handle.name().to_string(),
                kind: stream.kind,
                state: stream.handle.state(),
                finished: stream.handle.is_finished(),
                dispatched: stream.handle.dispatched(),
                skipped: stream.handle.skipped(),
            })
            .collect();
        let summary = RunSummary {
            streams,
            safe_time_ns: self.completion_time.reader().current_safe_time_ns(),
            forced_terminate: self.is_forced_terminate(),
            pool,
            errors: self.errors.drain(),
        };
        self.logger.info(
            SERVICE_MODULE,
            "service",
            &format!(
                "run finished with {} errors across {} streams",
                summary.errors.len(),
                summary.streams.len()
            ),
        );
        summary
    }
}

impl fmt::Debug for StreamExecutorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamExecutorService")
            .field("streams", &self.stream_names())
            .field("forced_terminate", &self.is_forced_terminate())
            .finish()
    }
}
