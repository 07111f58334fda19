use crate::completion_time::{LocalCompletionTimeWriter, COMPLETION_TIME_SENTINEL_NS};
use crate::operation::{Operation, OperationStream};
use crate::runtime::dispatcher::OperationDispatcher;
use crate::runtime::handler::HandlerInitError;
use crate::runtime::spinner::Spinner;
use crate::runtime::worker::{
    self, noop_writer, SourceCursor, StreamContext, StreamWorker, WorkerHandle, WorkerLifecycle,
    WorkerState,
};
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const ASYNC_MODULE: &str = "cadence::runtime::async_stream";

/// Merges a watermark-writing and a watermark-reading-only source and dispatches
/// each operation to the shared pool without waiting for it to finish.
///
/// Both sources are buffered one ahead. The earlier scheduled operation wins and
/// ties go to the reading source. Writing operations submit their initiated time
/// before dispatch; once the writing source is exhausted the sentinel time is
/// submitted so readers are no longer held back by this stream.
pub struct AsyncStreamWorker {
    name: String,
    ctx: StreamContext,
    writes: SourceCursor,
    reads: SourceCursor,
    writer: Arc<dyn LocalCompletionTimeWriter>,
    dispatcher: OperationDispatcher,
    early: Spinner,
    sentinel_submitted: bool,
}

impl AsyncStreamWorker {
    pub fn new(
        name: impl Into<String>,
        ctx: StreamContext,
        writes: OperationStream,
        reads: OperationStream,
        writer: Arc<dyn LocalCompletionTimeWriter>,
        dispatcher: OperationDispatcher,
    ) -> Self {
        let early = ctx.early_spinner();
        Self {
            name: name.into(),
            ctx,
            writes: SourceCursor::new(writes),
            reads: SourceCursor::new(reads),
            writer,
            dispatcher,
            early,
            sentinel_submitted: false,
        }
    }

    /// Spawns the worker on its own named thread.
    pub fn start(self) -> io::Result<WorkerHandle> {
        worker::spawn(self)
    }

    fn pull_sources(&mut self) {
        let errors = self.ctx.errors();
        self.writes.pull(errors, &self.name);
        self.reads.pull(errors, &self.name);
        self.submit_sentinel_if_exhausted();
    }

    fn submit_sentinel_if_exhausted(&mut self) {
        if self.sentinel_submitted || !self.writes.is_drained() {
            return;
        }
        self.sentinel_submitted = true;
        if let Err(err) = self.writer.submit_initiated(COMPLETION_TIME_SENTINEL_NS) {
            self.ctx.errors().report(&self.name, err.to_string());
        }
    }

    /// Picks the earlier buffered operation; `true` marks the writing source.
    fn next_operation(&mut self) -> Option<(Operation, bool)> {
        let from_writes = match (self.writes.peek_time_ns(), self.reads.peek_time_ns()) {
            (Some(write_ns), Some(read_ns)) => write_ns < read_ns,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        let operation = if from_writes {
            self.writes.take()
        } else {
            self.reads.take()
        };
        operation.map(|operation| (operation, from_writes))
    }

    fn process(&mut self, operation: Operation, from_writes: bool, lifecycle: &WorkerLifecycle) {
        let classification = match self.ctx.classifier().classify_operation(&operation) {
            Ok(classification) => classification,
            Err(err) => {
                self.skip(lifecycle, HandlerInitError::from(err).to_string());
                return;
            }
        };
        let writes_watermark = classification.dependency_mode.writes_watermark();
        let writer = if writes_watermark {
            self.writer.clone()
        } else {
            noop_writer()
        };
        let handler = match self.ctx.init_handler(operation, classification, writer) {
            Ok(handler) => handler,
            Err(err) => {
                self.skip(lifecycle, err.to_string());
                return;
            }
        };
        if writes_watermark {
            if let Err(err) = handler.submit_initiated() {
                self.skip(lifecycle, err.to_string());
                return;
            }
        }
        if from_writes {
            // detect the last writing operation before it is dispatched
            self.writes.pull(self.ctx.errors(), &self.name);
            self.submit_sentinel_if_exhausted();
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
                self.ctx.logger().warn(ASYNC_MODULE, &self.name, &err.to_string());
                self.skip(lifecycle, err.to_string());
            }
        }
    }

    fn skip(&self, lifecycle: &WorkerLifecycle, message: String) {
        lifecycle.record_skipped();
        self.ctx.errors().report(&self.name, message);
    }
}

impl StreamWorker for AsyncStreamWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn forced_terminate_flag(&self) -> Arc<AtomicBool> {
        self.ctx.forced_terminate_flag()
    }

    fn run(mut self, lifecycle: &WorkerLifecycle) {
        lifecycle.transition(WorkerState::Running);
        self.ctx.logger().info(ASYNC_MODULE, &self.name, "running");
        loop {
            if self.ctx.is_forced_terminate() {
                self.ctx.logger().warn(ASYNC_MODULE, &self.name, "forced terminate observed");
                break;
            }
            self.pull_sources();
            if !self.writes.is_settled() || !self.reads.is_settled() {
                continue;
            }
            let Some((operation, from_writes)) = self.next_operation() else {
                break;
            };
            self.process(operation, from_writes, lifecycle);
        }
        self.ctx.drain_stream(&self.name, lifecycle, &self.dispatcher);
    }
}
