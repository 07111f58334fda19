use cadence::{ManualTimeSource, SpinOutcome, Spinner, SystemTimeSource, TimeSource};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn wait_until_never_returns_before_target() {
    let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
    let spinner = Spinner::exact(clock.clone());
    let base = clock.now_ns();
    for offset_us in [0_u64, 50, 200, 1_000, 3_000] {
        let target = base + offset_us * 1_000;
        spinner.wait_until(target);
        assert!(clock.now_ns() >= target, "returned before {target}");
    }
}

#[test]
fn past_targets_return_immediately() {
    let clock = Arc::new(ManualTimeSource::new(5_000));
    let spinner = Spinner::exact(clock);
    let started = Instant::now();
    for target in [0_u64, 1_000, 4_999, 5_000] {
        spinner.wait_until(target);
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn spinner_follows_a_manual_clock() {
    let clock = Arc::new(ManualTimeSource::new(0));
    let spinner = Spinner::exact(clock.clone());
    let driver = {
        let clock = clock.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                thread::sleep(Duration::from_millis(1));
                clock.advance(Duration::from_nanos(100));
            }
        })
    };
    spinner.wait_until(1_000);
    assert!(clock.now_ns() >= 1_000);
    driver.join().unwrap();
}

#[test]
fn slightly_early_spinner_honours_offset() {
    let clock = Arc::new(ManualTimeSource::new(9_000));
    let spinner = Spinner::slightly_early(clock, Duration::from_nanos(1_000));
    // target 10_000 minus 1_000 offset is already reached
    spinner.wait_until(10_000);
    assert_eq!(spinner.offset(), Duration::from_nanos(1_000));
}

#[test]
fn abortable_wait_observes_flag_mid_spin() {
    let clock = Arc::new(ManualTimeSource::new(0));
    let spinner = Spinner::exact(clock);
    let abort = Arc::new(AtomicBool::new(false));
    let setter = {
        let abort = abort.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            abort.store(true, std::sync::atomic::Ordering::SeqCst);
        })
    };
    assert_eq!(
        spinner.wait_until_or_abort(u64::MAX, &abort),
        SpinOutcome::Aborted
    );
    setter.join().unwrap();
}

#[test]
fn power_nap_is_bounded() {
    let started = Instant::now();
    Spinner::power_nap(Duration::from_millis(2));
    Spinner::power_nap(Duration::ZERO);
    assert!(started.elapsed() >= Duration::from_millis(2));
    assert!(started.elapsed() < Duration::from_secs(1));
}
