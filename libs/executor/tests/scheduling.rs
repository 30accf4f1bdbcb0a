//! Delayed and periodic scheduling on an execution context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_executor::{ExecutionContext, ExecutorConfig, ExecutorError};
use courier_testing::{wait_until, Recorder, DEFAULT_TIMEOUT};

fn context(threads: usize) -> ExecutionContext {
    ExecutionContext::new(
        &ExecutorConfig::default()
            .with_name("sched")
            .with_worker_threads(threads),
    )
    .unwrap()
}

#[test]
fn test_delayed_task_fires_no_earlier_than_deadline() {
    let ctx = context(2);
    let submitted = Instant::now();
    let handle = ctx.schedule(Instant::now, Duration::from_millis(40)).unwrap();
    let fired = handle.join().unwrap();
    assert!(fired.duration_since(submitted) >= Duration::from_millis(40));
}

#[test]
fn test_fixed_delay_waits_after_each_run() {
    let ctx = context(2);
    let starts = Recorder::new();
    let sink = starts.clone();
    let handle = ctx
        .schedule_with_fixed_delay(
            move || {
                sink.record(Instant::now());
                std::thread::sleep(Duration::from_millis(10));
            },
            Duration::ZERO,
            Duration::from_millis(20),
        )
        .unwrap();

    assert!(starts.wait_for(4, DEFAULT_TIMEOUT));
    assert!(handle.cancel());

    let starts = starts.snapshot();
    for pair in starts.windows(2) {
        // Run time plus the delay.
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(30));
    }
}

#[test]
fn test_fixed_rate_keeps_cadence() {
    let ctx = context(2);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let started = Instant::now();
    let handle = ctx
        .schedule_at_fixed_rate(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
            Duration::from_millis(20),
        )
        .unwrap();

    assert!(wait_until(DEFAULT_TIMEOUT, || runs.load(Ordering::SeqCst) >= 5));
    handle.cancel();
    // First run at 10ms, fifth no earlier than 10 + 4 * 20ms.
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(handle.is_cancelled());
    assert!(handle.run_count() >= 5);
}

#[test]
fn test_periodic_panic_stops_rescheduling() {
    let ctx = context(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let handle = ctx
        .schedule_at_fixed_rate(
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                    panic!("second run fails");
                }
            },
            Duration::ZERO,
            Duration::from_millis(5),
        )
        .unwrap();

    assert!(wait_until(DEFAULT_TIMEOUT, || handle.is_done()));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!handle.is_cancelled());

    // The worker survived the panic.
    assert_eq!(ctx.submit(|| 1).unwrap().join(), Ok(1));
}

#[test]
fn test_submitted_panic_reported_through_handle() {
    let ctx = context(1);
    let handle = ctx.submit(|| -> u32 { panic!("boom") }).unwrap();
    assert_eq!(handle.join(), Err(ExecutorError::TaskPanicked("boom".to_string())));
    assert_eq!(ctx.submit(|| 2).unwrap().join(), Ok(2));
}

#[test]
fn test_shutdown_drains_queued_work() {
    let ctx = context(1);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let done = Arc::clone(&done);
        ctx.execute(move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    ctx.shutdown();
    assert!(ctx.await_termination(DEFAULT_TIMEOUT));
    assert_eq!(done.load(Ordering::SeqCst), 50);
    assert!(ctx.is_terminated());
}

#[tokio::test]
async fn test_handles_can_be_awaited() {
    let ctx = context(2);
    let value = ctx.submit(|| "ready").unwrap().await;
    assert_eq!(value, Ok("ready"));

    let delayed = ctx.schedule(|| 7, Duration::from_millis(10)).unwrap().await;
    assert_eq!(delayed, Ok(7));
}
