//! Error types for task submission and scheduling.

use thiserror::Error;

/// Errors that can occur when submitting or scheduling work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor has been shut down and no longer accepts work.
    #[error("executor is shut down")]
    Shutdown,

    /// A scheduling call was made on a context built without a scheduler.
    #[error("no scheduler configured for this execution context")]
    NoScheduler,

    /// The task panicked while running.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The task was cancelled (or discarded) before it produced a result.
    #[error("task cancelled")]
    Cancelled,

    /// The executor configuration is invalid.
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
}

impl ExecutorError {
    /// Returns true if the error means the submission was rejected outright.
    pub fn is_rejected(&self) -> bool {
        matches!(self, ExecutorError::Shutdown | ExecutorError::NoScheduler)
    }
}
