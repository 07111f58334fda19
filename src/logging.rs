use crate::temporal::TimeSource;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Severity levels accepted by the logger and the `log_level` config knob.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(LoggingError::UnknownLevel(other.to_string())),
        }
    }
}

/// Segment rotation policy (default 64 MiB × 4 segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 64 << 20,
            max_files: 4,
        }
    }
}

/// Accumulated log lines for one rotated segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// JSON-line logger with deterministic rotation semantics.
#[derive(Debug, Clone)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    files: VecDeque<LogFile>,
    active: LogFile,
    next_seq: u64,
}

impl JsonLineLogger {
    pub fn new(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            files: VecDeque::new(),
            active: LogFile::default(),
            next_seq: 0,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits a JSON-line entry; entries below the current level are dropped.
    pub fn log(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        module: &str,
        stream: &str,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.current_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            module,
            stream,
            seq: self.next_seq,
            message,
        };
        let line = serde_json::to_string(&record)?;
        self.next_seq += 1;
        self.rotate_if_needed(line.len());
        self.active.bytes_written = self.active.bytes_written.saturating_add(line.len());
        self.active.lines.push(line);
        Ok(())
    }

    /// Returns rotated history followed by the active segment.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter().chain(std::iter::once(&self.active))
    }

    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.files().flat_map(|file| file.lines().iter())
    }

    fn rotate_if_needed(&mut self, next_line_len: usize) {
        if self.active.bytes_written + next_line_len <= self.policy.max_bytes {
            return;
        }
        if !self.active.lines.is_empty() {
            self.files.push_back(std::mem::take(&mut self.active));
            while self.files.len() > self.policy.max_files {
                self.files.pop_front();
            }
        }
        self.active = LogFile::default();
    }
}

/// Cloneable handle shared by workers, the pool and the service.
///
/// Logging never fails the caller; serialization failures are counted instead.
#[derive(Clone)]
pub struct SharedLogger {
    inner: Arc<Mutex<JsonLineLogger>>,
    dropped: Arc<AtomicU64>,
    time_source: Arc<dyn TimeSource>,
}

impl SharedLogger {
    pub fn new(logger: JsonLineLogger, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
            dropped: Arc::new(AtomicU64::new(0)),
            time_source,
        }
    }

    pub fn log(&self, level: LogLevel, module: &str, stream: &str, message: &str) {
        let ts_ms = self.time_source.now_ms();
        if self
            .lock()
            .log(ts_ms, level, module, stream, message)
            .is_err()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn debug(&self, module: &str, stream: &str, message: &str) {
        self.log(LogLevel::Debug, module, stream, message);
    }

    pub fn info(&self, module: &str, stream: &str, message: &str) {
        self.log(LogLevel::Info, module, stream, message);
    }

    pub fn warn(&self, module: &str, stream: &str, message: &str) {
        self.log(LogLevel::Warn, module, stream, message);
    }

    pub fn error(&self, module: &str, stream: &str, message: &str) {
        self.log(LogLevel::Error, module, stream, message);
    }

    pub fn set_level(&self, level: LogLevel) {
        self.lock().set_level(level);
    }

    /// Entries that could not be serialized.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copies every retained line, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines().cloned().collect()
    }

    /// Writes every retained line to `out`, one JSON document per line.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for line in self.lines() {
            writeln!(out, "{line}")?;
        }
        out.flush()
    }

    fn lock(&self) -> MutexGuard<'_, JsonLineLogger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SharedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLogger")
            .field("level", &self.lock().level())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Errors surfaced by the logger.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unknown log level `{0}`")]
    UnknownLevel(String),
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    module: &'a str,
    stream: &'a str,
    seq: u64,
    message: &'a str,
}
