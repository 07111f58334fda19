use crate::classification::DependencyMode;
use crate::completion_time::{LocalCompletionTimeWriter, COMPLETION_TIME_SENTINEL_NS};
use crate::operation::{Operation, OperationStream};
use crate::runtime::dispatcher::OperationDispatcher;
use crate::runtime::handler::HandlerInitError;
use crate::runtime::spinner::Spinner;
use crate::runtime::worker::{
    self, noop_writer, SourceCursor, StreamContext, StreamWorker, WorkerHandle, WorkerLifecycle,
    WorkerState,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

const BLOCKING_MODULE: &str = "cadence::runtime::blocking_stream";
const IDLE_NAP: Duration = Duration::from_micros(50);

/// Which dependency modes receive the stream's real write-handle in a blocking
/// stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteEligibility {
    /// Only `READ_WRITE` operations write the watermark.
    #[default]
    ReadWriteOnly,
    /// `WRITE` and `READ_WRITE` operations write the watermark, as in async streams.
    AnyWriting,
}

impl WriteEligibility {
    pub fn admits(self, mode: DependencyMode) -> bool {
        match self {
            WriteEligibility::ReadWriteOnly => mode == DependencyMode::ReadWrite,
            WriteEligibility::AnyWriting => mode.writes_watermark(),
        }
    }
}

/// Runs one already-merged source with at most one operation in flight.
///
/// Every handler submits its initiated time to whichever write-handle it holds;
/// operations that are not write-eligible hold the no-op handle.
pub struct BlockingStreamWorker {
    name: String,
    ctx: StreamContext,
    operations: SourceCursor,
    writer: Arc<dyn LocalCompletionTimeWriter>,
    dispatcher: OperationDispatcher,
    early: Spinner,
    eligibility: WriteEligibility,
}

impl BlockingStreamWorker {
    pub fn new(
        name: impl Into<String>,
        ctx: StreamContext,
        operations: OperationStream,
        writer: Arc<dyn LocalCompletionTimeWriter>,
        dispatcher: OperationDispatcher,
    ) -> Self {
        let early = ctx.early_spinner();
        Self {
            name: name.into(),
            ctx,
            operations: SourceCursor::new(operations),
            writer,
            dispatcher,
            early,
            eligibility: WriteEligibility::default(),
        }
    }

    pub fn with_write_eligibility(mut self, eligibility: WriteEligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn write_eligibility(&self) -> WriteEligibility {
        self.eligibility
    }

    pub fn start(self) -> io::Result<WorkerHandle> {
        worker::spawn(self)
    }

    fn process(&self, operation: Operation, lifecycle: &WorkerLifecycle) {
        let classification = match self.ctx.classifier().classify_operation(&operation) {
            Ok(classification) => classification,
            Err(err) => {
                self.skip(lifecycle, HandlerInitError::from(err).to_string());
                return;
            }
        };
        let mode = classification.dependency_mode;
        let writer = if self.eligibility.admits(mode) {
            self.writer.clone()
        } else {
            if mode.reads_watermark() {
                // nothing of this stream below the start time is still running,
                // so its own writes must not hold the gate back
                let scheduled_ns = operation.scheduled_start_time_ns;
                if let Err(err) = self.writer.advance_to(scheduled_ns) {
                    self.ctx.errors().report(&self.name, err.to_string());
                }
            }
            noop_writer()
        };
        let handler = match self.ctx.init_handler(operation, classification, writer) {
            Ok(handler) => handler,
            Err(err) => {
                self.skip(lifecycle, err.to_string());
                return;
            }
        };
        if let Err(err) = handler.submit_initiated() {
            self.skip(lifecycle, err.to_string());
            return;
        }
        let scheduled_ns = handler.operation().scheduled_start_time_ns;
        self.early.wait_until(scheduled_ns);
        match self.dispatcher.dispatch(handler) {
            Ok(()) => lifecycle.record_dispatched(),
            Err(err) if err.executed() => {
                lifecycle.record_dispatched();
                self.ctx.errors().report(&self.name, err.to_string());
            }
            Err(err) => {
                self.ctx.logger().warn(BLOCKING_MODULE, &self.name, &err.to_string());
                self.skip(lifecycle, err.to_string());
            }
        }
        self.await_idle();
    }

    /// Waits for the single in-flight handler; forced terminate ends the wait.
    fn await_idle(&self) {
        while self.dispatcher.outstanding() > 0 && !self.ctx.is_forced_terminate() {
            Spinner::power_nap(IDLE_NAP);
        }
    }

    fn skip(&self, lifecycle: &WorkerLifecycle, message: String) {
        lifecycle.record_skipped();
        self.ctx.errors().report(&self.name, message);
    }
}

impl StreamWorker for BlockingStreamWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn forced_terminate_flag(&self) -> Arc<AtomicBool> {
        self.ctx.forced_terminate_flag()
    }

    fn run(mut self, lifecycle: &WorkerLifecycle) {
        lifecycle.transition(WorkerState::Running);
        self.ctx.logger().info(BLOCKING_MODULE, &self.name, "running");
        loop {
            if self.ctx.is_forced_terminate() {
                self.ctx.logger().warn(BLOCKING_MODULE, &self.name, "forced terminate observed");
                break;
            }
            self.operations.pull(self.ctx.errors(), &self.name);
            if self.operations.is_drained() {
                if let Err(err) = self.writer.submit_initiated(COMPLETION_TIME_SENTINEL_NS) {
                    self.ctx.errors().report(&self.name, err.to_string());
                }
                break;
            }
            if let Some(operation) = self.operations.take() {
                self.process(operation, lifecycle);
            }
        }
        self.ctx.drain_stream(&self.name, lifecycle, &self.dispatcher);
    }
}
