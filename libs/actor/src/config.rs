//! Dispatcher configuration.

use std::str::FromStr;

use courier_executor::ExecutorError;

use crate::error::DispatchError;

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Thread name prefix for the dispatcher's pool.
    pub name: String,

    /// Number of worker threads (message loops for the shared-pool strategy).
    pub worker_threads: usize,

    /// Messages one mailbox may deliver before its thread moves on to other
    /// mailboxes. `None` drains until the mailbox is empty.
    pub throughput: Option<usize>,

    /// How many times a crashed message loop is restarted before the
    /// dispatcher gives up on it.
    pub max_loop_restarts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            throughput: Some(64),
            max_loop_restarts: 16,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables.
    ///
    /// - `COURIER_DISPATCH_NAME` (default `dispatcher`)
    /// - `COURIER_DISPATCH_WORKER_THREADS` (default: available parallelism)
    /// - `COURIER_DISPATCH_THROUGHPUT` (default `64`, `0` = unbounded)
    /// - `COURIER_DISPATCH_MAX_LOOP_RESTARTS` (default `16`)
    pub fn from_env() -> Result<Self, DispatchError> {
        let defaults = Self::default();

        let name = std::env::var("COURIER_DISPATCH_NAME").unwrap_or(defaults.name);
        let worker_threads = env_number("COURIER_DISPATCH_WORKER_THREADS")?
            .unwrap_or(defaults.worker_threads);
        let throughput = match env_number("COURIER_DISPATCH_THROUGHPUT")? {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.throughput,
        };
        let max_loop_restarts = env_number("COURIER_DISPATCH_MAX_LOOP_RESTARTS")?
            .unwrap_or(defaults.max_loop_restarts);

        let config = Self {
            name,
            worker_threads,
            throughput,
            max_loop_restarts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_throughput(mut self, throughput: Option<usize>) -> Self {
        self.throughput = throughput;
        self
    }

    pub fn with_max_loop_restarts(mut self, max_loop_restarts: u32) -> Self {
        self.max_loop_restarts = max_loop_restarts;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.worker_threads == 0 {
            return Err(invalid("worker_threads must be at least 1"));
        }
        if self.throughput == Some(0) {
            return Err(invalid("throughput must be at least 1 (or unbounded)"));
        }
        if self.name.is_empty() {
            return Err(invalid("thread name prefix cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> DispatchError {
    ExecutorError::InvalidConfig(msg.to_string()).into()
}

fn env_number<T: FromStr>(var: &str) -> Result<Option<T>, DispatchError> {
    match std::env::var(var) {
        Ok(raw) => parse_number(var, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

/// Parse into the target width; out-of-range values are rejected.
fn parse_number<T: FromStr>(var: &str, raw: &str) -> Result<T, DispatchError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(&format!("{var}: invalid value '{raw}'")))
}
