use crate::error_reporter::ErrorReporter;
use crate::runtime::handler::OperationHandler;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Default queue depth for handlers waiting on a pool thread.
pub const DEFAULT_POOL_QUEUE_CAPACITY: usize = 1024;

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Why the pool refused a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Saturated,
    ShutDown,
}

impl RejectReason {
    fn label(self) -> &'static str {
        match self {
            RejectReason::Saturated => "pool queue saturated",
            RejectReason::ShutDown => "pool shut down",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Rejected submission; the handler is handed back untouched.
#[derive(Debug)]
pub struct PoolRejection {
    pub reason: RejectReason,
    pub handler: OperationHandler,
}

/// Errors raised while building a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("handler pool needs at least one thread")]
    NoThreads,
    #[error("handler pool queue capacity must be > 0")]
    ZeroCapacity,
    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Counters exported for the end-of-run summary.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    executed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl PoolMetrics {
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

struct PoolShared {
    name: String,
    queue: ArrayQueue<OperationHandler>,
    closed: AtomicBool,
    signal: Mutex<()>,
    cv: Condvar,
    errors: ErrorReporter,
    metrics: PoolMetrics,
}

impl PoolShared {
    fn wake_one(&self) {
        let _guard = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }

    fn park(&self) {
        let guard = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        if self.queue.is_empty() && !self.closed.load(Ordering::Acquire) {
            let _ = self
                .cv
                .wait_timeout(guard, IDLE_WAIT)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Releases every queued handler without running it.
    fn abandon_queued(&self) {
        while let Some(handler) = self.queue.pop() {
            let operation = handler.operation().to_string();
            if let Err(err) = handler.abandon() {
                self.errors.report(
                    &self.name,
                    format!("abandoned {operation} at shutdown: {err}"),
                );
            }
        }
    }

    fn execute(&self, thread_name: &str, handler: OperationHandler) {
        match handler.run() {
            Ok(()) => {
                self.metrics.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.errors.report(thread_name, err.to_string());
            }
        }
    }
}

/// Fixed set of named OS threads fed by a bounded lock-free queue.
///
/// Thread count bounds how many asynchronous operations run concurrently across
/// every async stream sharing the pool.
pub struct HandlerPool {
    shared: Arc<PoolShared>,
    threads: usize,
    joins: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl HandlerPool {
    pub fn new(
        name: impl Into<String>,
        threads: usize,
        queue_capacity: usize,
        errors: ErrorReporter,
    ) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::NoThreads);
        }
        if queue_capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let shared = Arc::new(PoolShared {
            name: name.into(),
            queue: ArrayQueue::new(queue_capacity),
            closed: AtomicBool::new(false),
            signal: Mutex::new(()),
            cv: Condvar::new(),
            errors,
            metrics: PoolMetrics::default(),
        });
        let pool = Self {
            shared,
            threads,
            joins: Mutex::new(Vec::with_capacity(threads)),
        };
        for idx in 0..threads {
            let join = pool.spawn_thread(idx);
            match join {
                Ok(join) => pool.lock_joins().push(join),
                Err(err) => {
                    pool.shutdown();
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        Ok(pool)
    }

    fn spawn_thread(&self, idx: usize) -> io::Result<thread::JoinHandle<()>> {
        let shared = self.shared.clone();
        let thread_name = format!("{}_{}", shared.name, idx);
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || loop {
                if let Some(handler) = shared.queue.pop() {
                    shared.execute(&thread_name, handler);
                    continue;
                }
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.park();
            })
    }

    /// Enqueues a handler; returns it to the caller when saturated or shut down.
    pub fn submit(&self, handler: OperationHandler) -> Result<(), PoolRejection> {
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PoolRejection {
                reason: RejectReason::ShutDown,
                handler,
            });
        }
        match self.shared.queue.push(handler) {
            Ok(()) => {
                // shutdown may have drained the queue between the check and the push
                if self.shared.closed.load(Ordering::SeqCst) {
                    self.shared.abandon_queued();
                } else {
                    self.shared.wake_one();
                }
                Ok(())
            }
            Err(handler) => {
                self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PoolRejection {
                    reason: RejectReason::Saturated,
                    handler,
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Handlers accepted but not yet picked up by a pool thread.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops accepting work, lets threads finish what is queued, and joins them.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_all();
        let joins: Vec<_> = self.lock_joins().drain(..).collect();
        for join in joins {
            let _ = join.join();
        }
        self.shared.abandon_queued();
    }

    fn lock_joins(&self) -> std::sync::MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.joins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HandlerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for HandlerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPool")
            .field("name", &self.shared.name)
            .field("threads", &self.threads)
            .field("queued", &self.queued())
            .finish()
    }
}
