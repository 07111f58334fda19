use crate::classification::{
    ClassificationError, DependencyClassifier, DependencyMode, ExecutionMode,
    OperationClassification,
};
use crate::logging::{LogLevel, LogRotationPolicy};
use crate::operation::OperationKind;
use crate::runtime::blocking_stream::WriteEligibility;
use crate::runtime::pool::DEFAULT_POOL_QUEUE_CAPACITY;
use crate::runtime::worker::StreamTiming;
use crate::workload::WorkloadConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

type ConfigMap = Map<String, Value>;

/// Driver configuration loaded from a JSON document; every knob has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub async_pool_threads: usize,
    pub async_pool_queue_capacity: usize,
    pub spinner_early_offset_us: u64,
    pub drain_poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub dependency_poll_interval_us: u64,
    pub dependency_timeout_ms: u64,
    pub blocking_write_eligibility: WriteEligibility,
    pub log_level: LogLevel,
    pub log_rotation: LogRotationPolicy,
    pub log_path: Option<PathBuf>,
    pub classifications: BTreeMap<String, OperationClassification>,
    pub workload: WorkloadConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            async_pool_threads: 4,
            async_pool_queue_capacity: DEFAULT_POOL_QUEUE_CAPACITY,
            spinner_early_offset_us: 1_000,
            drain_poll_interval_ms: 100,
            shutdown_timeout_ms: 10_000,
            dependency_poll_interval_us: 100,
            dependency_timeout_ms: 60_000,
            blocking_write_eligibility: WriteEligibility::default(),
            log_level: LogLevel::default(),
            log_rotation: LogRotationPolicy::default(),
            log_path: None,
            classifications: default_classifications(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Merges a JSON object over this config and returns the changed top-level
    /// keys, sorted. Nothing changes when the merged result fails validation.
    pub fn apply_patch(&mut self, patch: Value) -> Result<Vec<String>, ConfigError> {
        let patch_map = patch
            .as_object()
            .cloned()
            .ok_or_else(|| ConfigError::Invalid("patch must be a JSON object".into()))?;
        let mut current = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => return Err(ConfigError::Invalid("config must serialize to an object".into())),
        };
        let changed = merge_map(&mut current, &patch_map);
        if changed.is_empty() {
            return Ok(changed);
        }
        let next: Self = serde_json::from_value(Value::Object(current))?;
        next.validate()?;
        *self = next;
        Ok(changed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.async_pool_threads == 0 {
            return Err(ConfigError::Invalid("async_pool_threads must be > 0".into()));
        }
        if self.async_pool_queue_capacity == 0 {
            return Err(ConfigError::Invalid("async_pool_queue_capacity must be > 0".into()));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("drain_poll_interval_ms must be > 0".into()));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid("shutdown_timeout_ms must be > 0".into()));
        }
        if self.dependency_timeout_ms == 0 {
            return Err(ConfigError::Invalid("dependency_timeout_ms must be > 0".into()));
        }
        if self.log_rotation.max_bytes == 0 || self.log_rotation.max_files == 0 {
            return Err(ConfigError::Invalid("log_rotation limits must be > 0".into()));
        }
        self.workload.validate().map_err(ConfigError::Invalid)?;
        let classifier = self.classifier();
        let kinds: Vec<OperationKind> = self
            .workload
            .mix
            .iter()
            .map(|entry| OperationKind::new(entry.kind.as_str()))
            .collect();
        classifier.ensure_classified(&kinds)?;
        Ok(())
    }

    pub fn classifier(&self) -> DependencyClassifier {
        DependencyClassifier::new(
            self.classifications
                .iter()
                .map(|(kind, classification)| (OperationKind::new(kind.as_str()), *classification)),
        )
    }

    pub fn timing(&self) -> StreamTiming {
        StreamTiming::from(self)
    }
}

impl From<&DriverConfig> for StreamTiming {
    fn from(config: &DriverConfig) -> Self {
        Self {
            early_offset: Duration::from_micros(config.spinner_early_offset_us),
            drain_poll_interval: Duration::from_millis(config.drain_poll_interval_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            dependency_poll_interval: Duration::from_micros(config.dependency_poll_interval_us),
            dependency_timeout: Duration::from_millis(config.dependency_timeout_ms),
        }
    }
}

fn default_classifications() -> BTreeMap<String, OperationClassification> {
    [(
        "nothing".to_string(),
        OperationClassification::new(ExecutionMode::Asynchronous, DependencyMode::None),
    )]
    .into_iter()
    .collect()
}

fn merge_map(base: &mut ConfigMap, patch: &ConfigMap) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in patch {
        let entry = base.entry(key.clone()).or_insert(Value::Null);
        if entry != value {
            *entry = value.clone();
            changed.push(key.clone());
        }
    }
    changed.sort();
    changed
}

/// Errors raised while loading or validating the configuration. All of them are
/// fatal before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
}
