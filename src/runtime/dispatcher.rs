use crate::completion_time::CompletionTimeError;
use crate::runtime::handler::{HandlerError, OperationHandler};
use crate::runtime::pool::{HandlerPool, RejectReason};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Where dispatched handlers execute.
#[derive(Clone)]
pub enum DispatchMode {
    /// On the calling thread; `dispatch` returns once the handler completed.
    Inline,
    /// On the shared pool; `dispatch` returns once the pool accepted the handler.
    Pooled(Arc<HandlerPool>),
}

impl fmt::Debug for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => f.write_str("Inline"),
            DispatchMode::Pooled(pool) => f.debug_tuple("Pooled").field(&pool.name()).finish(),
        }
    }
}

/// Errors surfaced by [`OperationDispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{reason}: operation {operation} was not accepted")]
    Rejected {
        operation: String,
        reason: RejectReason,
    },
    /// The handler was rejected and its writer refused the release of its
    /// initiated time.
    #[error("{reason}: operation {operation} was not accepted and its initiated time was not released: {source}")]
    RejectedUnreleased {
        operation: String,
        reason: RejectReason,
        #[source]
        source: CompletionTimeError,
    },
    #[error(transparent)]
    Execution(#[from] HandlerError),
}

impl DispatchError {
    /// Whether the operation itself ran before the error surfaced.
    pub fn executed(&self) -> bool {
        match self {
            DispatchError::Execution(HandlerError::CheckFailed(_)) => false,
            DispatchError::Execution(_) => true,
            DispatchError::Rejected { .. } | DispatchError::RejectedUnreleased { .. } => false,
        }
    }
}

/// Hands ready handlers to execution and counts how many are outstanding.
///
/// The count is incremented before submission and decremented by a completion
/// callback on the handler, so it can never be observed low. It is only used to
/// detect drain-to-zero, never for admission.
#[derive(Debug, Clone)]
pub struct OperationDispatcher {
    mode: DispatchMode,
    outstanding: Arc<AtomicUsize>,
}

impl OperationDispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inline() -> Self {
        Self::new(DispatchMode::Inline)
    }

    pub fn pooled(pool: Arc<HandlerPool>) -> Self {
        Self::new(DispatchMode::Pooled(pool))
    }

    pub fn mode(&self) -> &DispatchMode {
        &self.mode
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn dispatch(&self, mut handler: OperationHandler) -> Result<(), DispatchError> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding.clone();
        handler.add_on_complete(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });
        match &self.mode {
            DispatchMode::Inline => handler.run().map_err(DispatchError::from),
            DispatchMode::Pooled(pool) => pool.submit(handler).map_err(|rejection| {
                let operation = rejection.handler.operation().to_string();
                let reason = rejection.reason;
                match rejection.handler.abandon() {
                    Ok(()) => DispatchError::Rejected { operation, reason },
                    Err(source) => DispatchError::RejectedUnreleased {
                        operation,
                        reason,
                        source,
                    },
                }
            }),
        }
    }
}
