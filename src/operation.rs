use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Type tag identifying an operation class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKind(String);

impl OperationKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for OperationKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable request description replayed against the system under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// Time at which the operation must start, in the driver's time base.
    pub scheduled_start_time_ns: u64,
    /// Logical time of the event the operation replays; defaults to the start time.
    #[serde(default)]
    pub time_stamp_ns: u64,
    /// Completion time that must be reached before a dependent operation may run.
    #[serde(default)]
    pub dependency_time_stamp_ns: u64,
    #[serde(default)]
    pub params: Value,
}

impl Operation {
    pub fn new(kind: impl Into<OperationKind>, scheduled_start_time_ns: u64) -> Self {
        Self {
            kind: kind.into(),
            scheduled_start_time_ns,
            time_stamp_ns: scheduled_start_time_ns,
            dependency_time_stamp_ns: 0,
            params: Value::Null,
        }
    }

    pub fn with_time_stamp(mut self, time_stamp_ns: u64) -> Self {
        self.time_stamp_ns = time_stamp_ns;
        self
    }

    pub fn with_dependency_time_stamp(mut self, dependency_time_stamp_ns: u64) -> Self {
        self.dependency_time_stamp_ns = dependency_time_stamp_ns;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}ns", self.kind, self.scheduled_start_time_ns)
    }
}

/// Failure raised by an operation source while yielding its next item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("operation source failed: {0}")]
    Retrieval(String),
}

/// Forward-only sequence of operations, pre-sorted by scheduled start time.
pub type OperationStream = Box<dyn Iterator<Item = Result<Operation, SourceError>> + Send>;

/// Wraps an in-memory operation list as an infallible stream.
pub fn stream_from<I>(operations: I) -> OperationStream
where
    I: IntoIterator<Item = Operation>,
    I::IntoIter: Send + 'static,
{
    Box::new(operations.into_iter().map(Ok))
}
