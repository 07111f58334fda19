use cadence::{
    stream_from, DependencyClassifier, DependencyMode, ErrorReporter, ExecutionMode,
    GlobalCompletionTimeReader, JsonLineLogger, LogRotationPolicy, ManualTimeSource, Operation,
    OperationClassification, OperationKind, ServiceSetup, SharedLogger, StreamAssignment,
    StreamExecutorService, StreamTiming, SyntheticTarget, TimeSource, WorkerState,
    WriteEligibility, COMPLETION_TIME_SENTINEL_NS,
};
use std::sync::Arc;
use std::time::Duration;

fn classifier() -> Arc<DependencyClassifier> {
    Arc::new(DependencyClassifier::new([
        (
            OperationKind::new("update"),
            OperationClassification::new(ExecutionMode::Asynchronous, DependencyMode::Write),
        ),
        (
            OperationKind::new("lookup"),
            OperationClassification::new(ExecutionMode::Asynchronous, DependencyMode::Read),
        ),
        (
            OperationKind::new("audit"),
            OperationClassification::new(ExecutionMode::Synchronous, DependencyMode::None),
        ),
        (
            OperationKind::new("transfer"),
            OperationClassification::new(ExecutionMode::Synchronous, DependencyMode::ReadWrite),
        ),
    ]))
}

fn setup(dependency_timeout: Duration) -> ServiceSetup {
    let time_source: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::new(1_000_000_000));
    let classifier = classifier();
    let kinds: Vec<OperationKind> = ["update", "lookup", "audit", "transfer"]
        .into_iter()
        .map(OperationKind::new)
        .collect();
    ServiceSetup {
        errors: ErrorReporter::new(time_source.clone()),
        logger: SharedLogger::new(
            JsonLineLogger::new(LogRotationPolicy::default()),
            time_source.clone(),
        ),
        time_source,
        classifier,
        factory: Arc::new(SyntheticTarget::new(kinds, Duration::ZERO)),
        timing: StreamTiming {
            drain_poll_interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(500),
            dependency_poll_interval: Duration::from_micros(50),
            dependency_timeout,
            ..StreamTiming::default()
        },
        pool_threads: 2,
        pool_queue_capacity: 64,
        write_eligibility: WriteEligibility::ReadWriteOnly,
    }
}

#[test]
fn mixed_run_finishes_clean_with_sentinel_safe_time() {
    let setup = setup(Duration::from_secs(10));
    let logger = setup.logger.clone();
    let assignments = vec![
        StreamAssignment::Async {
            name: "async_stream_0".into(),
            writes: stream_from(vec![
                Operation::new("update", 10),
                Operation::new("update", 20),
                Operation::new("update", 30),
            ]),
            reads: stream_from(vec![
                Operation::new("lookup", 15).with_dependency_time_stamp(10),
                Operation::new("lookup", 25).with_dependency_time_stamp(20),
            ]),
        },
        StreamAssignment::Blocking {
            name: "blocking_stream_0".into(),
            operations: stream_from(vec![Operation::new("audit", 12), Operation::new("audit", 22)]),
            writes_watermark: false,
        },
    ];
    let service = StreamExecutorService::start(setup, assignments).unwrap();
    assert_eq!(service.stream_names(), ["async_stream_0", "blocking_stream_0"]);
    let reader = service.reader();
    let summary = service.shutdown(Duration::from_secs(5));

    assert!(summary.is_clean(), "{:?}", summary.errors);
    assert!(!summary.forced_terminate);
    assert_eq!(summary.safe_time_ns, COMPLETION_TIME_SENTINEL_NS);
    assert_eq!(reader.current_safe_time_ns(), COMPLETION_TIME_SENTINEL_NS);
    assert_eq!(summary.streams.len(), 2);
    assert_eq!(summary.streams[0].dispatched, 5);
    assert_eq!(summary.streams[1].dispatched, 2);
    assert!(summary
        .streams
        .iter()
        .all(|stream| stream.state == WorkerState::Finished));
    assert_eq!(summary.pool.threads, 2);
    assert_eq!(summary.pool.executed, 5);
    assert!(logger
        .lines()
        .iter()
        .any(|line| line.contains("stream started")));
}

#[test]
fn run_without_streams_is_trivially_clean() {
    let service = StreamExecutorService::start(setup(Duration::from_secs(1)), Vec::new()).unwrap();
    let summary = service.shutdown(Duration::from_millis(100));
    assert!(summary.is_clean());
    assert!(summary.streams.is_empty());
    assert_eq!(summary.pool.threads, 0);
    assert_eq!(summary.safe_time_ns, COMPLETION_TIME_SENTINEL_NS);
}

#[test]
fn shutdown_forces_termination_of_a_stuck_stream() {
    // The blocking stream's own pending write holds the safe time at 100, so
    // the dependency at 5_000 can never be satisfied.
    let assignments = vec![StreamAssignment::Blocking {
        name: "blocking_stream_0".into(),
        operations: stream_from(vec![
            Operation::new("transfer", 100).with_dependency_time_stamp(5_000),
            Operation::new("audit", 200),
        ]),
        writes_watermark: true,
    }];
    let service =
        StreamExecutorService::start(setup(Duration::from_secs(60)), assignments).unwrap();
    let summary = service.shutdown(Duration::from_millis(50));

    assert!(summary.forced_terminate);
    assert!(!summary.is_clean());
    assert!(summary.streams[0].finished);
    assert!(summary
        .errors
        .iter()
        .any(|e| e.source == "dependency_gate" && e.message.contains("forced terminate")));
    assert_eq!(summary.streams[0].dispatched, 0);
}
