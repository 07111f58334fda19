use crate::operation::{Operation, OperationKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// How the driver hands an operation to the system under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs on a blocking stream: one operation in flight at a time.
    Synchronous,
    /// Runs on an async stream through the shared handler pool.
    Asynchronous,
}

/// Relationship between an operation and the completion-time watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyMode {
    None,
    Read,
    Write,
    ReadWrite,
}

impl DependencyMode {
    /// Operation must wait for the watermark before it executes.
    pub fn reads_watermark(self) -> bool {
        matches!(self, DependencyMode::Read | DependencyMode::ReadWrite)
    }

    /// Operation advances the watermark once it completes.
    pub fn writes_watermark(self) -> bool {
        matches!(self, DependencyMode::Write | DependencyMode::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyMode::None => "NONE",
            DependencyMode::Read => "READ",
            DependencyMode::Write => "WRITE",
            DependencyMode::ReadWrite => "READ_WRITE",
        }
    }
}

impl fmt::Display for DependencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pair returned by the classifier for every operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationClassification {
    pub execution_mode: ExecutionMode,
    pub dependency_mode: DependencyMode,
}

impl OperationClassification {
    pub fn new(execution_mode: ExecutionMode, dependency_mode: DependencyMode) -> Self {
        Self {
            execution_mode,
            dependency_mode,
        }
    }
}

/// Static lookup from operation type to its classification, fixed for the run.
#[derive(Debug, Clone, Default)]
pub struct DependencyClassifier {
    table: HashMap<OperationKind, OperationClassification>,
}

impl DependencyClassifier {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (OperationKind, OperationClassification)>,
    {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    pub fn classify(
        &self,
        kind: &OperationKind,
    ) -> Result<OperationClassification, ClassificationError> {
        self.table
            .get(kind)
            .copied()
            .ok_or_else(|| ClassificationError::Unclassified(kind.clone()))
    }

    pub fn classify_operation(
        &self,
        operation: &Operation,
    ) -> Result<OperationClassification, ClassificationError> {
        self.classify(&operation.kind)
    }

    /// Fails on the first type without a classification; used before a run starts.
    pub fn ensure_classified<'a, I>(&self, kinds: I) -> Result<(), ClassificationError>
    where
        I: IntoIterator<Item = &'a OperationKind>,
    {
        for kind in kinds {
            self.classify(kind)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Raised when an operation type has no classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("operation type `{0}` is not classified")]
    Unclassified(OperationKind),
}
