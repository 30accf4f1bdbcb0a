//! courier-bench - load generator for the courier runtime
//!
//! Drives each component (shared-pool dispatcher, pinned dispatcher,
//! partitioned executor, time wheel) with a synthetic workload and reports
//! throughput or timer lateness.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;
mod runtime;

use commands::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()));
    if cli.json_logs {
        registry.with(fmt.json()).init();
    } else {
        registry.with(fmt).init();
    }

    if let Err(e) = cli.run() {
        output::print_error(&e);
        std::process::exit(1);
    }
    Ok(())
}
