//! Process-wide producer pool.
//!
//! Benchmarks push load from this pool so producer threads are sized once,
//! from `COURIER_*` environment settings, for the whole process.

use std::sync::OnceLock;

use anyhow::Result;
use courier_executor::{ExecutionContext, ExecutorConfig};
use tracing::debug;

static PRODUCERS: OnceLock<ExecutionContext> = OnceLock::new();

/// The shared producer context, created on first use.
pub fn producers() -> Result<&'static ExecutionContext> {
    if let Some(context) = PRODUCERS.get() {
        return Ok(context);
    }
    let config = ExecutorConfig::from_env()?
        .with_name("bench-producer")
        .with_scheduler(false);
    let context = ExecutionContext::new(&config)?;
    debug!(threads = config.worker_threads, "Producer pool created");
    // A racing initializer wins; ours is dropped and shuts itself down.
    Ok(PRODUCERS.get_or_init(|| context))
}
