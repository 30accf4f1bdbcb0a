//! CLI definition and benchmark drivers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use courier_actor::{
    receiver_fn, Dispatcher, DispatcherConfig, MessageDispatcher, PinnedDispatcher,
};
use courier_executor::{
    Clock, HashedTimeWheel, MonotonicClock, PartitionConfig, PartitionedExecutor, ResizePolicy,
    WheelConfig,
};
use tracing::{info, warn};

use crate::output::{OutputFormat, Report};
use crate::runtime;

/// courier-bench - exercise the courier runtime under synthetic load.
#[derive(Debug, Parser)]
#[command(name = "courier-bench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Print the report as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, env = "COURIER_JSON_LOGS")]
    pub json_logs: bool,

    /// Give up waiting for delivery after this many seconds.
    #[arg(long, global = true, default_value_t = 60, env = "COURIER_BENCH_TIMEOUT_SECS")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Shared-pool dispatcher: many keys drained by a fixed set of loops.
    Dispatch(DispatchArgs),

    /// Pinned dispatcher: one ordered loop per key over a shared pool.
    Pinned(DispatchArgs),

    /// Partitioned executor: keyed tasks on ordered lanes.
    Partitioned(PartitionedArgs),

    /// Hashed time wheel: firing lateness.
    Wheel(WheelArgs),
}

#[derive(Debug, Args)]
struct DispatchArgs {
    /// Number of registered keys.
    #[arg(long, default_value_t = 64)]
    keys: u64,

    /// Messages posted to each key.
    #[arg(long, default_value_t = 1_000)]
    messages: u64,

    /// Dispatcher worker threads (default: COURIER_DISPATCH_WORKER_THREADS).
    #[arg(long)]
    threads: Option<usize>,

    /// Per-mailbox budget before yielding; 0 = unbounded.
    #[arg(long)]
    throughput: Option<usize>,

    /// Number of producer tasks posting concurrently.
    #[arg(long, default_value_t = 4)]
    producers: u64,

    /// Simulated blocking work per message, in microseconds.
    #[arg(long, default_value_t = 0)]
    block_us: u64,
}

#[derive(Debug, Args)]
struct PartitionedArgs {
    /// Number of distinct keys.
    #[arg(long, default_value_t = 64)]
    keys: u64,

    /// Tasks submitted per key.
    #[arg(long, default_value_t = 1_000)]
    tasks: u64,

    /// Partition count (default: COURIER_PARTITIONS).
    #[arg(long)]
    partitions: Option<usize>,

    /// Resize policy (default: COURIER_RESIZE_POLICY).
    #[arg(long)]
    resize_policy: Option<ResizePolicy>,

    /// Resize to this many partitions halfway through the run.
    #[arg(long)]
    resize_to: Option<usize>,
}

#[derive(Debug, Args)]
struct WheelArgs {
    /// Number of timers to push.
    #[arg(long, default_value_t = 10_000)]
    timers: u64,

    /// Timers are spread over this many milliseconds.
    #[arg(long, default_value_t = 1_000)]
    max_delay_ms: u64,

    /// Slot width in milliseconds.
    #[arg(long, default_value_t = 10)]
    unit_ms: u64,

    /// Number of slots.
    #[arg(long, default_value_t = 512)]
    slots: usize,

    /// Recently passed slots scanned per tick.
    #[arg(long, default_value_t = 2)]
    slot_per_round: usize,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let format = if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Table
        };
        let timeout = Duration::from_secs(self.timeout_secs);

        let report = match self.command {
            Commands::Dispatch(args) => run_dispatch(&args, Strategy::Shared, timeout)?,
            Commands::Pinned(args) => run_dispatch(&args, Strategy::Pinned, timeout)?,
            Commands::Partitioned(args) => run_partitioned(&args, timeout)?,
            Commands::Wheel(args) => run_wheel(&args, timeout)?,
        };
        report.print(format);
        Ok(())
    }
}

// =============================================================================
// Dispatchers
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Shared,
    Pinned,
}

fn run_dispatch(args: &DispatchArgs, strategy: Strategy, timeout: Duration) -> Result<Report> {
    if args.producers == 0 {
        bail!("--producers must be at least 1");
    }

    let mut config = DispatcherConfig::from_env()?.with_name("bench-dispatch");
    if let Some(threads) = args.threads {
        config = config.with_worker_threads(threads);
    }
    if let Some(throughput) = args.throughput {
        config = config.with_throughput((throughput > 0).then_some(throughput));
    }

    let (name, dispatcher): (&'static str, Arc<dyn MessageDispatcher<u64, u64>>) = match strategy {
        Strategy::Shared => ("dispatch", Arc::new(Dispatcher::new(&config)?)),
        Strategy::Pinned => ("pinned", Arc::new(PinnedDispatcher::new(&config)?)),
    };

    let delivered = Arc::new(AtomicU64::new(0));
    let out_of_order = Arc::new(AtomicU64::new(0));
    let block = Duration::from_micros(args.block_us);
    for key in 0..args.keys {
        let next = AtomicU64::new(0);
        let delivered = Arc::clone(&delivered);
        let out_of_order = Arc::clone(&out_of_order);
        let receiver = receiver_fn(move |seq: u64| {
            if !block.is_zero() {
                thread::sleep(block);
            }
            if next.fetch_add(1, Ordering::Relaxed) != seq {
                out_of_order.fetch_add(1, Ordering::Relaxed);
            }
            delivered.fetch_add(1, Ordering::Release);
            Ok(())
        });
        dispatcher
            .register(key, Arc::new(receiver), false)
            .with_context(|| format!("registering key {key}"))?;
    }

    let total = args.keys * args.messages;
    info!(benchmark = name, keys = args.keys, total, "Starting run");
    let started = Instant::now();

    let producers = runtime::producers()?;
    let mut handles = Vec::new();
    for producer in 0..args.producers {
        let dispatcher = Arc::clone(&dispatcher);
        let (keys, messages, stride) = (args.keys, args.messages, args.producers);
        // Each key is fed by exactly one producer so its post order is defined.
        handles.push(producers.submit(move || {
            for key in (producer..keys).step_by(stride as usize) {
                for seq in 0..messages {
                    dispatcher.post_message(&key, seq);
                }
            }
        })?);
    }
    for handle in handles {
        handle.join()?;
    }

    if !wait_for(timeout, || delivered.load(Ordering::Acquire) >= total) {
        bail!(
            "timed out: {} of {total} messages delivered",
            delivered.load(Ordering::Acquire)
        );
    }
    let elapsed = started.elapsed();

    dispatcher.close();
    if !dispatcher.await_termination(timeout) {
        warn!(benchmark = name, "Dispatcher did not terminate in time");
    }
    let stats = dispatcher.stats();

    Ok(Report::new(name, total, elapsed)
        .metric("keys", args.keys)
        .metric("worker_threads", config.worker_threads)
        .metric(
            "throughput",
            config
                .throughput
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
        )
        .metric("out_of_order", out_of_order.load(Ordering::Relaxed))
        .metric("dropped", stats.dropped)
        .metric("failed", stats.failed))
}

// =============================================================================
// Partitioned Executor
// =============================================================================

fn run_partitioned(args: &PartitionedArgs, timeout: Duration) -> Result<Report> {
    let mut config = PartitionConfig::from_env()?;
    if let Some(partitions) = args.partitions {
        config = config.with_partitions(partitions);
    }
    if let Some(policy) = args.resize_policy {
        config = config.with_resize_policy(policy);
    }
    let executor: PartitionedExecutor<u64> = PartitionedExecutor::new(&config)?;

    let completed = Arc::new(AtomicU64::new(0));
    let out_of_order = Arc::new(AtomicU64::new(0));
    let next: Arc<Vec<AtomicU64>> = Arc::new((0..args.keys).map(|_| AtomicU64::new(0)).collect());

    let total = args.keys * args.tasks;
    let started = Instant::now();
    for seq in 0..args.tasks {
        if seq == args.tasks / 2 {
            if let Some(target) = args.resize_to {
                resize(&executor, target)?;
            }
        }
        for key in 0..args.keys {
            let completed = Arc::clone(&completed);
            let out_of_order = Arc::clone(&out_of_order);
            let next = Arc::clone(&next);
            executor.execute(key, move || {
                if next[key as usize].fetch_add(1, Ordering::Relaxed) != seq {
                    out_of_order.fetch_add(1, Ordering::Relaxed);
                }
                completed.fetch_add(1, Ordering::Release);
            })?;
        }
    }

    if !wait_for(timeout, || completed.load(Ordering::Acquire) >= total) {
        bail!(
            "timed out: {} of {total} tasks completed",
            completed.load(Ordering::Acquire)
        );
    }
    let elapsed = started.elapsed();

    let partitions = executor.partitions();
    executor.shutdown();
    if !executor.await_termination(timeout) {
        warn!("Partitioned executor did not terminate in time");
    }

    Ok(Report::new("partitioned", total, elapsed)
        .metric("keys", args.keys)
        .metric("partitions", partitions)
        .metric("resize_policy", format!("{:?}", config.resize_policy))
        .metric("out_of_order", out_of_order.load(Ordering::Relaxed)))
}

fn resize(executor: &PartitionedExecutor<u64>, target: usize) -> Result<()> {
    let current = executor.partitions();
    if target > current {
        executor.expand_to(target)?;
    } else {
        executor.shrink_to(target)?;
    }
    info!(from = current, to = target, "Resized partitions mid-run");
    Ok(())
}

// =============================================================================
// Time Wheel
// =============================================================================

fn run_wheel(args: &WheelArgs, timeout: Duration) -> Result<Report> {
    if args.max_delay_ms == 0 {
        bail!("--max-delay-ms must be at least 1");
    }
    let clock = Arc::new(MonotonicClock::new());
    let fired = Arc::new(AtomicU64::new(0));
    let lateness_total = Arc::new(AtomicU64::new(0));
    let lateness_max = Arc::new(AtomicU64::new(0));

    let wheel = {
        let clock = Arc::clone(&clock);
        let fired = Arc::clone(&fired);
        let lateness_total = Arc::clone(&lateness_total);
        let lateness_max = Arc::clone(&lateness_max);
        HashedTimeWheel::new(
            WheelConfig {
                slot_count: args.slots,
                unit: Duration::from_millis(args.unit_ms),
                slot_per_round: args.slot_per_round,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
            move |due_ms: u64| {
                let late = clock.now_ms().saturating_sub(due_ms);
                lateness_total.fetch_add(late, Ordering::Relaxed);
                lateness_max.fetch_max(late, Ordering::Relaxed);
                fired.fetch_add(1, Ordering::Release);
            },
        )?
    };
    wheel.start()?;

    let started = Instant::now();
    let now = clock.now_ms();
    for i in 0..args.timers {
        // Deterministic spread across the delay window.
        let due = now + 1 + (i.wrapping_mul(7_919) % args.max_delay_ms);
        wheel.push(due, due);
    }

    let drained = wait_for(timeout, || fired.load(Ordering::Acquire) >= args.timers);
    let elapsed = started.elapsed();
    let unfired = wheel.stop();
    if !drained {
        warn!(unfired = unfired.len(), "Timed out waiting for timers");
    }

    let count = fired.load(Ordering::Acquire);
    let mean = if count == 0 {
        0.0
    } else {
        lateness_total.load(Ordering::Relaxed) as f64 / count as f64
    };

    Ok(Report::new("wheel", count, elapsed)
        .metric("slots", args.slots)
        .metric("unit_ms", args.unit_ms)
        .metric("slot_per_round", args.slot_per_round)
        .metric("mean_lateness_ms", format!("{mean:.2}"))
        .metric("max_lateness_ms", lateness_max.load(Ordering::Relaxed))
        .metric("unfired", unfired.len()))
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "courier-bench",
            "--json",
            "partitioned",
            "--partitions",
            "8",
            "--resize-policy",
            "quiesce",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Partitioned(args) => {
                assert_eq!(args.partitions, Some(8));
                assert_eq!(args.resize_policy, Some(ResizePolicy::Quiesce));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        let result = Cli::try_parse_from(["courier-bench", "partitioned", "--resize-policy", "drop"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_small_dispatch_run() {
        let args = DispatchArgs {
            keys: 4,
            messages: 50,
            threads: Some(2),
            throughput: Some(8),
            producers: 2,
            block_us: 0,
        };
        let report = run_dispatch(&args, Strategy::Shared, Duration::from_secs(10)).unwrap();
        assert_eq!(report.operations, 200);
        let out_of_order = report
            .metrics
            .iter()
            .find(|m| m.name == "out_of_order")
            .map(|m| m.value.clone());
        assert_eq!(out_of_order.as_deref(), Some("0"));
    }

    #[test]
    fn test_small_wheel_run() {
        let args = WheelArgs {
            timers: 20,
            max_delay_ms: 50,
            unit_ms: 5,
            slots: 64,
            slot_per_round: 2,
        };
        let report = run_wheel(&args, Duration::from_secs(10)).unwrap();
        assert_eq!(report.operations, 20);
    }

    #[test]
    fn test_wheel_run_with_single_slot_lookback() {
        let args = WheelArgs {
            timers: 50,
            max_delay_ms: 200,
            unit_ms: 10,
            slots: 8,
            slot_per_round: 1,
        };
        let report = run_wheel(&args, Duration::from_secs(10)).unwrap();
        assert_eq!(report.operations, 50);
        let unfired = report
            .metrics
            .iter()
            .find(|m| m.name == "unfired")
            .map(|m| m.value.clone());
        assert_eq!(unfired.as_deref(), Some("0"));
    }
}
