//! Stream workers, dispatch and the timing primitives they share.

pub mod async_stream;
pub mod blocking_stream;
pub mod dispatcher;
pub mod gate;
pub mod handler;
pub mod pool;
pub mod service;
pub mod spinner;
pub mod worker;

pub use async_stream::AsyncStreamWorker;
pub use blocking_stream::{BlockingStreamWorker, WriteEligibility};
pub use dispatcher::{DispatchError, DispatchMode, OperationDispatcher};
pub use gate::DependencyGate;
pub use handler::{
    runner_from_fn, BeforeExecuteCheck, HandlerError, HandlerInitError, OperationError,
    OperationHandler, OperationHandlerFactory, OperationRunner,
};
pub use pool::{
    HandlerPool, PoolError, PoolMetrics, PoolRejection, RejectReason,
    DEFAULT_POOL_QUEUE_CAPACITY,
};
pub use service::{
    PoolSummary, RunSummary, ServiceError, ServiceSetup, StreamAssignment, StreamExecutorService,
    StreamKind, StreamSummary,
};
pub use spinner::{SpinOutcome, Spinner, DEFAULT_EARLY_OFFSET};
pub use worker::{
    spawn, StreamContext, StreamTiming, StreamWorker, WorkerHandle, WorkerLifecycle, WorkerState,
};
