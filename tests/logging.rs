use cadence::{JsonLineLogger, LogLevel, LogRotationPolicy, ManualTimeSource, SharedLogger};
use serde_json::Value;
use std::sync::Arc;
use std::thread;

#[test]
fn json_logger_serializes_entries() {
    let policy = LogRotationPolicy {
        max_bytes: 256,
        max_files: 2,
    };
    let mut logger = JsonLineLogger::new(policy);
    logger
        .log(100, LogLevel::Info, "cadence::test", "async_0", "first entry")
        .unwrap();
    let lines: Vec<_> = logger.lines().collect();
    assert_eq!(lines.len(), 1);
    let parsed: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["ts"], 100);
    assert_eq!(parsed["level"], "INFO");
    assert_eq!(parsed["module"], "cadence::test");
    assert_eq!(parsed["stream"], "async_0");
    assert_eq!(parsed["seq"], 0);
}

#[test]
fn loglevel_override_filters_entries() {
    let policy = LogRotationPolicy {
        max_bytes: 512,
        max_files: 1,
    };
    let mut logger = JsonLineLogger::new(policy);
    logger.set_level(LogLevel::Warn);
    logger
        .log(0, LogLevel::Info, "cadence", "blocking_0", "info suppressed")
        .unwrap();
    logger
        .log(1, LogLevel::Warn, "cadence", "blocking_0", "warn visible")
        .unwrap();
    let lines: Vec<_> = logger.lines().collect();
    assert_eq!(lines.len(), 1);
    let parsed: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["level"], "WARN");
    assert_eq!(parsed["message"], "warn visible");
    // suppressed entries do not consume a sequence number
    assert_eq!(parsed["seq"], 0);
}

#[test]
fn rotation_discards_old_segments() {
    let policy = LogRotationPolicy {
        max_bytes: 64,
        max_files: 2,
    };
    let mut logger = JsonLineLogger::new(policy);
    for _ in 0..10 {
        logger
            .log(0, LogLevel::Info, "module", "async_0", "payload")
            .unwrap();
    }
    let segments: Vec<_> = logger.files().collect();
    assert!(segments.len() <= 3, "active + rotated segments retained");
    assert!(segments.iter().any(|file| !file.lines().is_empty()));
}

#[test]
fn shared_logger_stamps_time_and_orders_threads() {
    let clock = Arc::new(ManualTimeSource::new(5_000_000));
    let logger = SharedLogger::new(JsonLineLogger::new(LogRotationPolicy::default()), clock);
    let workers: Vec<_> = (0..4)
        .map(|idx| {
            let logger = logger.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    logger.info("cadence::test", &format!("stream_{idx}"), "tick");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    logger.debug("cadence::test", "service", "below threshold");

    let lines = logger.lines();
    assert_eq!(lines.len(), 100);
    for (expected_seq, line) in lines.iter().enumerate() {
        let parsed: Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["ts"], 5);
        assert_eq!(parsed["seq"], expected_seq as u64);
    }

    let mut out = Vec::new();
    logger.write_to(&mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap().lines().count(), 100);
    assert_eq!(logger.dropped(), 0);
}

#[test]
fn levels_parse_from_config_spelling() {
    assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
    assert_eq!("TRACE".parse::<LogLevel>().unwrap(), LogLevel::Trace);
    assert!("loud".parse::<LogLevel>().is_err());
}
