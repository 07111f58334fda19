use crate::classification::ClassificationError;
use crate::completion_time::{CompletionTimeError, LocalCompletionTimeWriter};
use crate::operation::{Operation, OperationKind};
use crate::runtime::spinner::Spinner;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Executes one operation against the system under test.
pub trait OperationRunner: Send {
    fn execute(&mut self, operation: &Operation) -> Result<(), OperationError>;
}

impl<F> OperationRunner for F
where
    F: FnMut(&Operation) -> Result<(), OperationError> + Send,
{
    fn execute(&mut self, operation: &Operation) -> Result<(), OperationError> {
        self(operation)
    }
}

/// Boxes a closure as a runner, pinning its signature for inference.
pub fn runner_from_fn<F>(runner: F) -> Box<dyn OperationRunner>
where
    F: FnMut(&Operation) -> Result<(), OperationError> + Send + 'static,
{
    Box::new(runner)
}

/// Resolves an operation to the runner that knows how to execute its type.
pub trait OperationHandlerFactory: Send + Sync {
    fn runner_for(&self, operation: &Operation)
        -> Result<Box<dyn OperationRunner>, HandlerInitError>;
}

/// Check evaluated on the executing thread right before the operation runs.
///
/// Returning `false` skips execution; the handler still completes.
pub trait BeforeExecuteCheck: Send {
    fn check(&mut self, operation: &Operation) -> bool;
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Failure reported by a runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),
}

/// Failure while turning an operation into a ready handler.
#[derive(Debug, Error)]
pub enum HandlerInitError {
    #[error("unsupported operation type `{0}`")]
    Unsupported(OperationKind),
    #[error("failed to initialize handler for {operation}: {reason}")]
    Initialization { operation: String, reason: String },
    #[error(transparent)]
    Classification(#[from] ClassificationError),
}

/// Failure while running a dispatched handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("before-execute check failed for {0}; operation skipped")]
    CheckFailed(String),
    #[error("operation {operation} failed: {source}")]
    Execution {
        operation: String,
        #[source]
        source: OperationError,
    },
    #[error("operation {0} panicked")]
    Panicked(String),
    #[error("completion time submission failed: {0}")]
    CompletionTime(#[from] CompletionTimeError),
}

/// Single-use execution context bound to exactly one operation.
///
/// Completion callbacks run exactly once: after `run`, after `abandon`, or when
/// an unfinished handler is dropped.
pub struct OperationHandler {
    operation: Operation,
    runner: Box<dyn OperationRunner>,
    writer: Arc<dyn LocalCompletionTimeWriter>,
    spinner: Spinner,
    checks: Vec<Box<dyn BeforeExecuteCheck>>,
    on_complete: Vec<CompletionCallback>,
}

impl OperationHandler {
    pub fn new(
        operation: Operation,
        runner: Box<dyn OperationRunner>,
        writer: Arc<dyn LocalCompletionTimeWriter>,
        spinner: Spinner,
    ) -> Self {
        Self {
            operation,
            runner,
            writer,
            spinner,
            checks: Vec::new(),
            on_complete: Vec::new(),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn writer(&self) -> &Arc<dyn LocalCompletionTimeWriter> {
        &self.writer
    }

    pub fn add_before_execute_check(&mut self, check: Box<dyn BeforeExecuteCheck>) {
        self.checks.push(check);
    }

    pub fn add_on_complete<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete.push(Box::new(callback));
    }

    /// Submits the scheduled start time as "initiated" on this handler's writer.
    pub fn submit_initiated(&self) -> Result<(), CompletionTimeError> {
        self.writer.submit_initiated(self.operation.scheduled_start_time_ns)
    }

    /// Runs checks, waits for the exact start time, executes, then completes.
    pub fn run(mut self) -> Result<(), HandlerError> {
        let outcome = self.execute_once();
        let completed = self
            .writer
            .submit_completed(self.operation.scheduled_start_time_ns);
        self.complete();
        outcome?;
        completed?;
        Ok(())
    }

    /// Completes without executing, releasing the initiated time and callbacks.
    ///
    /// Callbacks run even when the writer refuses the completion.
    pub fn abandon(mut self) -> Result<(), CompletionTimeError> {
        let released = self
            .writer
            .submit_completed(self.operation.scheduled_start_time_ns);
        self.complete();
        released
    }

    fn execute_once(&mut self) -> Result<(), HandlerError> {
        for check in self.checks.iter_mut() {
            if !check.check(&self.operation) {
                return Err(HandlerError::CheckFailed(self.operation.to_string()));
            }
        }
        self.spinner.wait_for_scheduled_start(&self.operation);
        let operation = &self.operation;
        let runner = &mut self.runner;
        match panic::catch_unwind(AssertUnwindSafe(|| runner.execute(operation))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(HandlerError::Execution {
                operation: operation.to_string(),
                source,
            }),
            Err(_) => Err(HandlerError::Panicked(operation.to_string())),
        }
    }

    fn complete(&mut self) {
        for callback in self.on_complete.drain(..) {
            callback();
        }
    }
}

impl Drop for OperationHandler {
    fn drop(&mut self) {
        self.complete();
    }
}

impl fmt::Debug for OperationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandler")
            .field("operation", &self.operation)
            .field("checks", &self.checks.len())
            .field("on_complete", &self.on_complete.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion_time::NoopCompletionTimeWriter;
    use crate::temporal::ManualTimeSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler(runner: Box<dyn OperationRunner>) -> OperationHandler {
        let clock = Arc::new(ManualTimeSource::new(1_000));
        OperationHandler::new(
            Operation::new("op", 10),
            runner,
            Arc::new(NoopCompletionTimeWriter),
            Spinner::exact(clock),
        )
    }

    struct Deny;

    impl BeforeExecuteCheck for Deny {
        fn check(&mut self, _operation: &Operation) -> bool {
            false
        }
    }

    #[test]
    fn callbacks_run_once_after_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handler = handler(runner_from_fn(|_| Ok(())));
        let counter = calls.clone();
        handler.add_on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handler.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_check_skips_runner_but_completes() {
        let executed = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = executed.clone();
        let mut handler = handler(runner_from_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        handler.add_before_execute_check(Box::new(Deny));
        let counter = calls.clone();
        handler.add_on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let err = handler.run().unwrap_err();
        assert!(matches!(err, HandlerError::CheckFailed(_)));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_runner_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handler = handler(runner_from_fn(|_| panic!("runner blew up")));
        let counter = calls.clone();
        handler.add_on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let err = handler.run().unwrap_err();
        assert!(matches!(err, HandlerError::Panicked(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_handler_still_runs_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handler = handler(runner_from_fn(|_| Ok(())));
        let counter = calls.clone();
        handler.add_on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(handler);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
