//! Configuration for execution contexts and partitioned executors.

use crate::error::ExecutorError;
use crate::partition::ResizePolicy;

/// Execution context configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Thread name prefix.
    pub name: String,

    /// Number of worker threads.
    pub worker_threads: usize,

    /// Whether to start a scheduler thread for delayed and periodic tasks.
    pub enable_scheduler: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            worker_threads: default_parallelism(),
            enable_scheduler: true,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from environment variables.
    ///
    /// - `COURIER_THREAD_NAME` (default `courier`)
    /// - `COURIER_WORKER_THREADS` (default: available parallelism)
    /// - `COURIER_ENABLE_SCHEDULER` (default `true`)
    pub fn from_env() -> Result<Self, ExecutorError> {
        let defaults = Self::default();

        let name = std::env::var("COURIER_THREAD_NAME").unwrap_or(defaults.name);

        let worker_threads = match std::env::var("COURIER_WORKER_THREADS") {
            Ok(raw) => raw.parse().map_err(|_| {
                ExecutorError::InvalidConfig(format!("COURIER_WORKER_THREADS: invalid value '{raw}'"))
            })?,
            Err(_) => defaults.worker_threads,
        };

        let enable_scheduler = std::env::var("COURIER_ENABLE_SCHEDULER")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.enable_scheduler);

        let config = Self {
            name,
            worker_threads,
            enable_scheduler,
        };
        config.validate()?;
        Ok(config)
    }

    /// Builder-style override of the worker count.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Builder-style override of the thread name prefix.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder-style toggle for the scheduler thread.
    pub fn with_scheduler(mut self, enable_scheduler: bool) -> Self {
        self.enable_scheduler = enable_scheduler;
        self
    }

    /// Check the configuration for values the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.worker_threads == 0 {
            return Err(ExecutorError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(ExecutorError::InvalidConfig(
                "thread name prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partitioned executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Thread name prefix.
    pub name: String,

    /// Initial number of partitions (one thread each).
    pub partitions: usize,

    /// What a resize does to ordering.
    pub resize_policy: ResizePolicy,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            name: "partition".to_string(),
            partitions: default_parallelism(),
            resize_policy: ResizePolicy::default(),
        }
    }
}

impl PartitionConfig {
    /// Load configuration from environment variables.
    ///
    /// - `COURIER_PARTITIONS` (default: available parallelism)
    /// - `COURIER_RESIZE_POLICY` (`reorder` or `quiesce`, default `reorder`)
    pub fn from_env() -> Result<Self, ExecutorError> {
        let defaults = Self::default();

        let partitions = match std::env::var("COURIER_PARTITIONS") {
            Ok(raw) => raw.parse().map_err(|_| {
                ExecutorError::InvalidConfig(format!("COURIER_PARTITIONS: invalid value '{raw}'"))
            })?,
            Err(_) => defaults.partitions,
        };

        let resize_policy = match std::env::var("COURIER_RESIZE_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.resize_policy,
        };

        let config = Self {
            name: defaults.name,
            partitions,
            resize_policy,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_resize_policy(mut self, resize_policy: ResizePolicy) -> Self {
        self.resize_policy = resize_policy;
        self
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.partitions == 0 {
            return Err(ExecutorError::InvalidConfig(
                "partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
