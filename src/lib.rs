//! Precise operation-scheduling driver: replays time-ordered operation streams
//! against a system under test, holding dependent operations behind a shared
//! completion-time watermark.

pub mod app;
pub mod classification;
pub mod completion_time;
pub mod config;
pub mod error_reporter;
pub mod logging;
pub mod operation;
pub mod runtime;
pub mod temporal;
pub mod workload;

pub use classification::{
    ClassificationError, DependencyClassifier, DependencyMode, ExecutionMode,
    OperationClassification,
};
pub use completion_time::{
    CompletionTimeError, CompletionTimeReader, CompletionTimeService, CompletionTimeWriter,
    GlobalCompletionTimeReader, LocalCompletionTimeWriter, NoopCompletionTimeWriter,
    COMPLETION_TIME_SENTINEL_NS,
};
pub use config::{ConfigError, DriverConfig};
pub use error_reporter::{ErrorRecord, ErrorReporter};
pub use logging::{
    JsonLineLogger, LogFile, LogLevel, LogRotationPolicy, LoggingError, SharedLogger,
};
pub use operation::{stream_from, Operation, OperationKind, OperationStream, SourceError};
pub use runtime::{
    runner_from_fn, AsyncStreamWorker, BeforeExecuteCheck, BlockingStreamWorker, DependencyGate,
    DispatchError, DispatchMode, HandlerError, HandlerInitError, HandlerPool, OperationDispatcher,
    OperationError, OperationHandler, OperationHandlerFactory, OperationRunner, PoolError,
    RejectReason, RunSummary, ServiceError, ServiceSetup, SpinOutcome, Spinner, StreamAssignment,
    StreamContext, StreamExecutorService, StreamTiming, WorkerHandle, WorkerState,
    WriteEligibility,
};
pub use temporal::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use workload::{
    partition_by_classification, StreamPartition, SyntheticTarget, SyntheticWorkload,
    WorkloadConfig, WorkloadMixEntry,
};
