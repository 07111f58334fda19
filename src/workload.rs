//! Synthetic workloads and the routing of operations onto streams.

use crate::classification::{ClassificationError, DependencyClassifier, ExecutionMode};
use crate::operation::{stream_from, Operation, OperationKind};
use crate::runtime::blocking_stream::WriteEligibility;
use crate::runtime::handler::{
    runner_from_fn, HandlerInitError, OperationHandlerFactory, OperationRunner,
};
use crate::runtime::service::StreamAssignment;
use crate::runtime::spinner::Spinner;
use crate::temporal::duration_ns;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

/// Share of one operation type in a synthetic workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadMixEntry {
    pub kind: String,
    pub weight: u32,
}

/// Shape of the no-op workload the binary generates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub operation_count: usize,
    pub interval_us: u64,
    /// Lead between run start and the first scheduled operation.
    pub start_delay_ms: u64,
    /// How far behind its own start time an operation's dependency lies.
    pub dependency_lag_us: u64,
    pub simulated_latency_us: u64,
    pub mix: Vec<WorkloadMixEntry>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            operation_count: 1_000,
            interval_us: 1_000,
            start_delay_ms: 100,
            dependency_lag_us: 10_000,
            simulated_latency_us: 0,
            mix: vec![WorkloadMixEntry {
                kind: "nothing".into(),
                weight: 1,
            }],
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.mix.is_empty() {
            return Err("workload.mix must name at least one operation type".into());
        }
        if self.mix.iter().all(|entry| entry.weight == 0) {
            return Err("workload.mix weights must not all be zero".into());
        }
        if self.mix.iter().any(|entry| entry.kind.is_empty()) {
            return Err("workload.mix kinds must be non-empty".into());
        }
        Ok(())
    }
}

/// Deterministic generator for evenly spaced operations.
#[derive(Debug, Clone)]
pub struct SyntheticWorkload {
    config: WorkloadConfig,
    // one slot per unit of weight, in mix order
    slots: Vec<OperationKind>,
}

impl SyntheticWorkload {
    pub fn new(config: WorkloadConfig) -> Self {
        let slots = config
            .mix
            .iter()
            .flat_map(|entry| {
                std::iter::repeat(OperationKind::new(entry.kind.as_str()))
                    .take(entry.weight as usize)
            })
            .collect();
        Self { config, slots }
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Operations scheduled from `start_ns + start_delay`, one every `interval_us`,
    /// cycling through the weighted mix.
    pub fn generate(&self, start_ns: u64) -> Vec<Operation> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        let first_ns =
            start_ns.saturating_add(duration_ns(Duration::from_millis(self.config.start_delay_ms)));
        let interval_ns = duration_ns(Duration::from_micros(self.config.interval_us));
        let lag_ns = duration_ns(Duration::from_micros(self.config.dependency_lag_us));
        (0..self.config.operation_count)
            .map(|idx| {
                let kind = self.slots[idx % self.slots.len()].clone();
                let scheduled_ns = first_ns.saturating_add(interval_ns.saturating_mul(idx as u64));
                Operation::new(kind, scheduled_ns)
                    .with_dependency_time_stamp(scheduled_ns.saturating_sub(lag_ns))
                    .with_params(json!({ "seq": idx }))
            })
            .collect()
    }
}

/// Operations split by how they must be executed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamPartition {
    pub async_writes: Vec<Operation>,
    pub async_reads: Vec<Operation>,
    pub blocking: Vec<Operation>,
}

impl StreamPartition {
    pub fn is_empty(&self) -> bool {
        self.async_writes.is_empty() && self.async_reads.is_empty() && self.blocking.is_empty()
    }

    /// At most one async and one blocking stream; empty streams are omitted.
    pub fn into_assignments(
        self,
        classifier: &DependencyClassifier,
        eligibility: WriteEligibility,
    ) -> Vec<StreamAssignment> {
        let mut assignments = Vec::new();
        if !self.async_writes.is_empty() || !self.async_reads.is_empty() {
            assignments.push(StreamAssignment::Async {
                name: "async_stream_0".into(),
                writes: stream_from(self.async_writes),
                reads: stream_from(self.async_reads),
            });
        }
        if !self.blocking.is_empty() {
            let writes_watermark = self.blocking.iter().any(|operation| {
                classifier
                    .classify_operation(operation)
                    .map(|classification| eligibility.admits(classification.dependency_mode))
                    .unwrap_or(false)
            });
            assignments.push(StreamAssignment::Blocking {
                name: "blocking_stream_0".into(),
                operations: stream_from(self.blocking),
                writes_watermark,
            });
        }
        assignments
    }
}

/// Routes operations by classification, preserving order within each output.
///
/// Asynchronous operations that write the watermark go to the writing source;
/// every other asynchronous operation is reading-only.
pub fn partition_by_classification(
    operations: impl IntoIterator<Item = Operation>,
    classifier: &DependencyClassifier,
) -> Result<StreamPartition, ClassificationError> {
    let mut partition = StreamPartition::default();
    for operation in operations {
        let classification = classifier.classify_operation(&operation)?;
        match classification.execution_mode {
            ExecutionMode::Synchronous => partition.blocking.push(operation),
            ExecutionMode::Asynchronous if classification.dependency_mode.writes_watermark() => {
                partition.async_writes.push(operation)
            }
            ExecutionMode::Asynchronous => partition.async_reads.push(operation),
        }
    }
    Ok(partition)
}

/// Target that accepts the configured operation types and does nothing for a
/// fixed simulated latency.
#[derive(Debug, Clone)]
pub struct SyntheticTarget {
    supported: HashSet<OperationKind>,
    latency: Duration,
}

impl SyntheticTarget {
    pub fn new(supported: impl IntoIterator<Item = OperationKind>, latency: Duration) -> Self {
        Self {
            supported: supported.into_iter().collect(),
            latency,
        }
    }

    pub fn from_config(config: &WorkloadConfig) -> Self {
        Self::new(
            config
                .mix
                .iter()
                .map(|entry| OperationKind::new(entry.kind.as_str())),
            Duration::from_micros(config.simulated_latency_us),
        )
    }
}

impl OperationHandlerFactory for SyntheticTarget {
    fn runner_for(
        &self,
        operation: &Operation,
    ) -> Result<Box<dyn OperationRunner>, HandlerInitError> {
        if !self.supported.contains(&operation.kind) {
            return Err(HandlerInitError::Unsupported(operation.kind.clone()));
        }
        let latency = self.latency;
        Ok(runner_from_fn(move |_| {
            if !latency.is_zero() {
                Spinner::power_nap(latency);
            }
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::{DependencyMode, OperationClassification};

    fn mix(entries: &[(&str, u32)]) -> WorkloadConfig {
        WorkloadConfig {
            operation_count: 6,
            interval_us: 1,
            start_delay_ms: 0,
            dependency_lag_us: 2,
            simulated_latency_us: 0,
            mix: entries
                .iter()
                .map(|(kind, weight)| WorkloadMixEntry {
                    kind: kind.to_string(),
                    weight: *weight,
                })
                .collect(),
        }
    }

    #[test]
    fn generator_cycles_weighted_mix() {
        let workload = SyntheticWorkload::new(mix(&[("write", 1), ("read", 2)]));
        let operations = workload.generate(10_000);
        let kinds: Vec<&str> = operations.iter().map(|op| op.kind.as_str()).collect();
        assert_eq!(kinds, ["write", "read", "read", "write", "read", "read"]);
        assert_eq!(operations[0].scheduled_start_time_ns, 10_000);
        assert_eq!(operations[1].scheduled_start_time_ns, 11_000);
        assert_eq!(operations[1].dependency_time_stamp_ns, 9_000);
    }

    #[test]
    fn partition_routes_by_mode() {
        let classifier = DependencyClassifier::new([
            (
                OperationKind::new("write"),
                OperationClassification::new(ExecutionMode::Asynchronous, DependencyMode::Write),
            ),
            (
                OperationKind::new("read"),
                OperationClassification::new(ExecutionMode::Asynchronous, DependencyMode::Read),
            ),
            (
                OperationKind::new("sync"),
                OperationClassification::new(ExecutionMode::Synchronous, DependencyMode::None),
            ),
        ]);
        let operations = vec![
            Operation::new("write", 1),
            Operation::new("sync", 2),
            Operation::new("read", 3),
        ];
        let partition = partition_by_classification(operations, &classifier).unwrap();
        assert_eq!(partition.async_writes.len(), 1);
        assert_eq!(partition.async_reads.len(), 1);
        assert_eq!(partition.blocking.len(), 1);

        let err = partition_by_classification(vec![Operation::new("other", 4)], &classifier)
            .unwrap_err();
        assert_eq!(err, ClassificationError::Unclassified(OperationKind::new("other")));
    }

    #[test]
    fn target_rejects_unknown_types() {
        let target = SyntheticTarget::new([OperationKind::new("nothing")], Duration::ZERO);
        assert!(target.runner_for(&Operation::new("nothing", 0)).is_ok());
        assert!(matches!(
            target.runner_for(&Operation::new("other", 0)),
            Err(HandlerInitError::Unsupported(_))
        ));
    }
}
