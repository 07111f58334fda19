use crate::config::DriverConfig;
use crate::logging::{JsonLineLogger, SharedLogger};
use crate::runtime::service::{RunSummary, ServiceSetup, StreamExecutorService};
use crate::temporal::{SystemTimeSource, TimeSource};
use crate::workload::{partition_by_classification, SyntheticTarget, SyntheticWorkload};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage:
  cadence run <config.json> [--set <json-object>]...
  cadence validate <config.json> [--set <json-object>]...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Validate,
}

#[derive(Debug)]
struct Args {
    command: Command,
    config: PathBuf,
    overrides: Vec<String>,
}

impl Args {
    fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut iter = args.into_iter();
        let command = match iter.next().as_deref() {
            Some("run") => Command::Run,
            Some("validate") => Command::Validate,
            Some(other) => bail!("unknown command: {other}\n{USAGE}"),
            None => bail!("{USAGE}"),
        };
        let mut config = None;
        let mut overrides = Vec::new();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--set" => {
                    let patch = iter
                        .next()
                        .ok_or_else(|| anyhow!("--set requires a JSON object"))?;
                    overrides.push(patch);
                }
                other if other.starts_with("--") => bail!("unknown argument: {other}"),
                path if config.is_none() => config = Some(PathBuf::from(path)),
                extra => bail!("unexpected argument: {extra}"),
            }
        }
        let config = config.ok_or_else(|| anyhow!("missing config path\n{USAGE}"))?;
        Ok(Self {
            command,
            config,
            overrides,
        })
    }
}

/// Binary entrypoint: parses the process arguments and runs the command.
pub fn run() -> Result<()> {
    run_from(env::args().skip(1))
}

/// Runs `cadence` with explicit arguments (without the program name).
pub fn run_from<I>(args: I) -> Result<()>
where
    I: IntoIterator<Item = String>,
{
    let args = Args::parse(args)?;
    let config = load_config(&args)?;
    match args.command {
        Command::Validate => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run => {
            let summary = execute(&config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.is_clean() {
                bail!(
                    "run finished with {} reported errors",
                    summary.errors.len()
                );
            }
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<DriverConfig> {
    let mut config = DriverConfig::from_path(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    for raw in &args.overrides {
        let patch: Value = serde_json::from_str(raw)
            .with_context(|| format!("--set value is not valid JSON: {raw}"))?;
        config
            .apply_patch(patch)
            .with_context(|| format!("failed to apply --set {raw}"))?;
    }
    Ok(config)
}

/// Generates the synthetic workload, runs it to completion and returns the
/// summary. Logs are flushed before returning.
pub fn execute(config: &DriverConfig) -> Result<RunSummary> {
    let time_source: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
    let mut logger = JsonLineLogger::new(config.log_rotation);
    logger.set_level(config.log_level);
    let logger = SharedLogger::new(logger, time_source.clone());
    let factory = Arc::new(SyntheticTarget::from_config(&config.workload));
    let setup = ServiceSetup::from_config(config, time_source.clone(), logger.clone(), factory);

    let operations = SyntheticWorkload::new(config.workload.clone()).generate(time_source.now_ns());
    let partition = partition_by_classification(operations, &setup.classifier)
        .context("workload contains an unclassified operation type")?;
    let assignments =
        partition.into_assignments(&setup.classifier, config.blocking_write_eligibility);
    let service = StreamExecutorService::start(setup, assignments)?;
    let summary = service.shutdown(run_budget(config));
    flush_logs(config, &logger)?;
    Ok(summary)
}

/// Time the whole schedule needs plus the drain grace period.
fn run_budget(config: &DriverConfig) -> Duration {
    let workload = &config.workload;
    let schedule_us = workload
        .interval_us
        .saturating_mul(workload.operation_count as u64)
        .saturating_add(workload.simulated_latency_us);
    Duration::from_millis(workload.start_delay_ms)
        + Duration::from_micros(schedule_us)
        + Duration::from_millis(config.shutdown_timeout_ms)
}

fn flush_logs(config: &DriverConfig, logger: &SharedLogger) -> Result<()> {
    match &config.log_path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let mut out = BufWriter::new(file);
            logger.write_to(&mut out)?;
            out.flush()?;
        }
        None => {
            let stderr = io::stderr();
            let mut out = stderr.lock();
            logger.write_to(&mut out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<Args> {
        Args::parse(raw.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn parses_run_with_overrides() {
        let parsed = args(&["run", "driver.json", "--set", "{\"async_pool_threads\":2}"]).unwrap();
        assert_eq!(parsed.command, Command::Run);
        assert_eq!(parsed.config, PathBuf::from("driver.json"));
        assert_eq!(parsed.overrides.len(), 1);
    }

    #[test]
    fn rejects_unknown_command_and_missing_path() {
        assert!(args(&["bench", "driver.json"]).is_err());
        assert!(args(&["validate"]).is_err());
        assert!(args(&["run", "a.json", "b.json"]).is_err());
    }
}
